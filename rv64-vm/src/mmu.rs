//! Emulated MMU with byte-level memory permissions, able to detect accesses
//! to uninitialized memory and to restore itself to a snapshot by copying
//! back only the blocks that were modified.

use std::cmp;
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};

use thiserror::Error;

/// Readable memory. Aimed to be used with `Perm`.
pub const PERM_READ: u8 = 1;

/// Writable memory. Aimed to be used with `Perm`.
pub const PERM_WRITE: u8 = 1 << 1;

/// Executable memory. Aimed to be used with `Perm`.
pub const PERM_EXEC: u8 = 1 << 2;

/// Read-after-write memory. Aimed to be used with `Perm`.
///
/// This permission is assigned when allocating writable memory. If a memory
/// position has this flag and is written, the READ permission is assigned
/// afterwards. This allows us to detect accesses to uninitialized memory.
pub const PERM_RAW: u8 = 1 << 3;

/// Block size used for resetting and tracking memory which has been
/// modified. The sweet spot is usually somewhere in 128-4096 bytes.
pub const DIRTY_BLOCK_SIZE: usize = 4096;

/// Initial base address of the guest allocator.
pub const ALLOC_BASE: usize = 0x10000;

/// Memory error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Address range exceeds the guest address space, or its end cannot be
    /// represented.
    #[error("address range out of bounds: addr={addr} size={size}")]
    OutOfBounds { addr: VirtAddr, size: usize },

    /// Read past the allocation high-water mark.
    #[error("read beyond allocated memory: addr={addr} size={size}")]
    UnallocatedRead { addr: VirtAddr, size: usize },

    /// Write past the allocation high-water mark.
    #[error("write beyond allocated memory: addr={addr} size={size}")]
    UnallocatedWrite { addr: VirtAddr, size: usize },

    /// Read fault. `addr` is the first byte missing the READ permission;
    /// reading uninitialized (RAW) memory ends up here as well.
    #[error("read denied: addr={addr} missing={missing}")]
    ReadDenied { addr: VirtAddr, missing: Perm },

    /// Write fault. `addr` is the first byte missing the WRITE permission.
    #[error("write denied: addr={addr} missing={missing}")]
    WriteDenied { addr: VirtAddr, missing: Perm },

    /// A permission-qualified read did not satisfy the expected mask.
    #[error("permission mismatch: addr={addr} expected={expected}")]
    PermMismatch { addr: VirtAddr, expected: Perm },

    /// The bump allocator cannot satisfy the request.
    #[error("guest allocator exhausted: size={size}")]
    OutOfArena { size: usize },
}

/// Memory permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perm(pub u8);

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut disp = String::new();

        disp.push(if self.0 & PERM_READ != 0 { 'R' } else { '-' });
        disp.push(if self.0 & PERM_WRITE != 0 { 'W' } else { '-' });
        disp.push(if self.0 & PERM_EXEC != 0 { 'X' } else { '-' });

        if self.0 & PERM_RAW != 0 {
            disp.push('r');
        }

        write!(f, "{}", disp)
    }
}

impl Deref for Perm {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub usize);

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Deref for VirtAddr {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for VirtAddr {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Emulated memory management unit.
///
/// An `Mmu` owns a flat guest address space starting at address 0, one
/// permission byte per memory byte, and a bump allocator handing out
/// 16-byte-aligned ranges starting at [`ALLOC_BASE`]. Forks full-copy the
/// arena; [`Mmu::reset`] restores a fork to its parent's state by copying
/// back only the dirty blocks.
#[derive(Debug, PartialEq, Eq)]
pub struct Mmu {
    /// Memory size.
    size: usize,

    /// Memory contents.
    memory: Vec<u8>,

    /// Byte-level memory permissions.
    perms: Vec<Perm>,

    /// Block indices in `memory` which are dirty, in first-write order.
    dirty: Vec<usize>,

    /// Tracks which parts of memory have been dirtied.
    dirty_bitmap: Vec<u64>,

    /// Base address of the next allocation.
    cur_alc: VirtAddr,
}

impl Mmu {
    /// Returns a new Mmu with a given memory `size`.
    ///
    /// # Panics
    ///
    /// This function panics if `size` is lower than [`ALLOC_BASE`], as the
    /// arena must contain the allocator base.
    pub fn new(size: usize) -> Mmu {
        assert!(size >= ALLOC_BASE, "invalid size");

        Mmu {
            size,
            memory: vec![0; size],
            perms: vec![Perm(0); size],
            dirty: Vec::with_capacity(size / DIRTY_BLOCK_SIZE + 1),
            dirty_bitmap: vec![0; size / DIRTY_BLOCK_SIZE / 64 + 1],
            cur_alc: VirtAddr(ALLOC_BASE),
        }
    }

    /// Returns the size of the guest address space.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the base address of the next allocation.
    pub fn alloc_cursor(&self) -> VirtAddr {
        self.cur_alc
    }

    /// Returns the number of blocks modified since the last fork or reset.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Returns a copy of the MMU. All memory is marked as clean in the new
    /// copy, which makes the current state the snapshot the copy can be
    /// reset to.
    pub fn fork(&self) -> Mmu {
        Mmu {
            size: self.size,
            memory: self.memory.clone(),
            perms: self.perms.clone(),
            dirty: Vec::with_capacity(self.size / DIRTY_BLOCK_SIZE + 1),
            dirty_bitmap: vec![0; self.size / DIRTY_BLOCK_SIZE / 64 + 1],
            cur_alc: self.cur_alc,
        }
    }

    /// Restores memory to the state of `other`, copying back only the blocks
    /// modified since the last fork or reset.
    ///
    /// The allocation cursor is left untouched. Forks inherit the cursor of
    /// their parent, so it is already deterministic given the parent state.
    ///
    /// # Panics
    ///
    /// This function panics if `other` has a different arena size.
    pub fn reset(&mut self, other: &Mmu) {
        assert!(self.size == other.size, "arena size mismatch");

        for &block in &self.dirty {
            let start = block * DIRTY_BLOCK_SIZE;
            let end = cmp::min(start + DIRTY_BLOCK_SIZE, self.size);

            // Zeroing the whole word is coarse, but every block sharing it
            // is also present in `dirty` and re-zeroes it.
            self.dirty_bitmap[block / 64] = 0;

            self.memory[start..end].copy_from_slice(&other.memory[start..end]);
            self.perms[start..end].copy_from_slice(&other.perms[start..end]);
        }

        self.dirty.clear();
    }

    /// Allocate `size` bytes as WRITE|RAW in the guest address space,
    /// returning the 16-byte-aligned base of the allocation.
    ///
    /// Permissions are applied to the requested size only; the padding up to
    /// the aligned size keeps zero permissions and acts as a guard band
    /// between allocations. Allocating zero bytes returns the current
    /// cursor without side effects.
    pub fn allocate(&mut self, size: usize) -> Result<VirtAddr, Error> {
        if size == 0 {
            return Ok(self.cur_alc);
        }

        // 16-byte align the allocation size. The base stays aligned because
        // the initial cursor is aligned and every increment is aligned.
        let aligned = size
            .checked_add(0xf)
            .ok_or(Error::OutOfArena { size })?
            & !0xf;

        let base = self.cur_alc;
        let new_cursor = base
            .checked_add(aligned)
            .ok_or(Error::OutOfArena { size })?;

        // Strict comparison, so at least one guard byte remains between the
        // high-water mark and the end of the arena.
        if new_cursor >= self.size {
            return Err(Error::OutOfArena { size });
        }

        self.cur_alc = VirtAddr(new_cursor);
        self.set_perms_unchecked(base, size, Perm(PERM_WRITE | PERM_RAW));

        Ok(base)
    }

    /// Move the allocation cursor to `addr`. Intended for the loader, which
    /// must place program segments below the high-water mark before any
    /// forks exist.
    ///
    /// # Panics
    ///
    /// This function panics if `addr` would move the cursor backwards or
    /// past the end of the arena.
    pub fn set_alloc_base(&mut self, addr: VirtAddr) {
        assert!(
            *addr >= *self.cur_alc && *addr <= self.size,
            "invalid allocation base"
        );

        self.cur_alc = addr;
    }

    /// Set memory permissions in the given range. The affected blocks are
    /// marked dirty, so permission changes made after a fork roll back on
    /// reset like data writes do.
    pub fn set_perms(
        &mut self,
        addr: VirtAddr,
        size: usize,
        perms: Perm,
    ) -> Result<(), Error> {
        let end = addr
            .checked_add(size)
            .ok_or(Error::OutOfBounds { addr, size })?;

        if end > self.size {
            return Err(Error::OutOfBounds { addr, size });
        }

        self.set_perms_unchecked(addr, size, perms);

        Ok(())
    }

    /// Set memory permissions in the given range without checking memory
    /// boundaries.
    fn set_perms_unchecked(&mut self, addr: VirtAddr, size: usize, perms: Perm) {
        self.perms[*addr..*addr + size]
            .iter_mut()
            .for_each(|p| *p = perms);

        self.update_dirty(addr, size);
    }

    /// Copy the bytes in `src` to the given memory address. This function
    /// fails if the destination range exceeds the arena or the allocation
    /// high-water mark, or if any destination byte is not writable. A denied
    /// write has no side effects.
    ///
    /// Destination bytes marked RAW become readable: the first write to an
    /// allocation is what initializes it.
    pub fn write(&mut self, addr: VirtAddr, src: &[u8]) -> Result<(), Error> {
        if src.is_empty() {
            return Ok(());
        }

        let size = src.len();
        let end = addr
            .checked_add(size)
            .ok_or(Error::OutOfBounds { addr, size })?;

        if end > self.size {
            return Err(Error::OutOfBounds { addr, size });
        }

        if end > *self.cur_alc {
            return Err(Error::UnallocatedWrite { addr, size });
        }

        // Single scan: every byte must be writable, and any RAW byte means a
        // promotion pass is needed after the copy.
        let mut has_raw = false;
        for (offset, p) in self.perms[*addr..end].iter().enumerate() {
            has_raw |= **p & PERM_RAW != 0;

            if **p & PERM_WRITE == 0 {
                return Err(Error::WriteDenied {
                    addr: VirtAddr(*addr + offset),
                    missing: Perm(PERM_WRITE),
                });
            }
        }

        self.memory[*addr..end].copy_from_slice(src);

        self.update_dirty(addr, size);

        // Add PERM_READ in case of RAW. RAW itself stays set; promoting an
        // already-promoted byte again is idempotent.
        if has_raw {
            self.perms[*addr..end]
                .iter_mut()
                .filter(|p| ***p & PERM_RAW != 0)
                .for_each(|p| *p = Perm(**p | PERM_READ));
        }

        Ok(())
    }

    /// Copy the data starting at the specified memory address into `dst`.
    /// This function fails if the source range exceeds the arena or the
    /// allocation high-water mark, or if any source byte is not readable.
    ///
    /// Freshly allocated memory has WRITE|RAW but not READ, so reading it
    /// before the first write fails with [`Error::ReadDenied`].
    pub fn read(&self, addr: VirtAddr, dst: &mut [u8]) -> Result<(), Error> {
        self.read_with(addr, dst, Perm(PERM_READ))
    }

    /// Copy the data starting at the specified memory address into `dst`,
    /// requiring every bit in `perms` to be set on every source byte. This
    /// is how instruction bytes are fetched from EXEC-only segments without
    /// demanding READ.
    pub fn read_with(
        &self,
        addr: VirtAddr,
        dst: &mut [u8],
        perms: Perm,
    ) -> Result<(), Error> {
        if dst.is_empty() {
            return Ok(());
        }

        let size = dst.len();
        let end = addr
            .checked_add(size)
            .ok_or(Error::OutOfBounds { addr, size })?;

        if end > self.size {
            return Err(Error::OutOfBounds { addr, size });
        }

        if end > *self.cur_alc {
            return Err(Error::UnallocatedRead { addr, size });
        }

        for (offset, p) in self.perms[*addr..end].iter().enumerate() {
            if **p & *perms != *perms {
                let fault = VirtAddr(*addr + offset);

                return Err(if *perms & PERM_READ != 0 {
                    Error::ReadDenied {
                        addr: fault,
                        missing: Perm(*perms & !**p),
                    }
                } else {
                    Error::PermMismatch {
                        addr: fault,
                        expected: perms,
                    }
                });
            }
        }

        dst.copy_from_slice(&self.memory[*addr..end]);

        Ok(())
    }

    /// Copy the bytes in `src` to the given memory address without checking
    /// permissions and without marking memory as dirty. Host-side use only;
    /// writes done through here are invisible to `reset`.
    pub fn poke(&mut self, addr: VirtAddr, src: &[u8]) -> Result<(), Error> {
        let size = src.len();
        let end = addr
            .checked_add(size)
            .ok_or(Error::OutOfBounds { addr, size })?;

        self.memory
            .get_mut(*addr..end)
            .ok_or(Error::OutOfBounds { addr, size })?
            .copy_from_slice(src);

        Ok(())
    }

    /// Copy the data starting at the specified memory address into `dst`
    /// without checking permissions. Host-side use only.
    pub fn peek(&self, addr: VirtAddr, dst: &mut [u8]) -> Result<(), Error> {
        let size = dst.len();
        let end = addr
            .checked_add(size)
            .ok_or(Error::OutOfBounds { addr, size })?;

        let src = self
            .memory
            .get(*addr..end)
            .ok_or(Error::OutOfBounds { addr, size })?;

        dst.copy_from_slice(src);

        Ok(())
    }

    /// Write an integer value into a given memory address as little-endian
    /// bytes, going through the same checks as [`Mmu::write`].
    pub fn write_int<T: GuestInt>(
        &mut self,
        addr: VirtAddr,
        value: T,
    ) -> Result<(), Error> {
        let mut bytes = [0u8; 16];
        value.to_le_slice(&mut bytes[..T::SIZE]);

        self.write(addr, &bytes[..T::SIZE])
    }

    /// Read a little-endian integer from a given memory address, going
    /// through the same checks as [`Mmu::read`].
    pub fn read_int<T: GuestInt>(&self, addr: VirtAddr) -> Result<T, Error> {
        self.read_int_with(addr, Perm(PERM_READ))
    }

    /// Read a little-endian integer from a given memory address, requiring
    /// the expected permissions. Used to fetch instruction words from
    /// EXEC-only memory.
    pub fn read_int_with<T: GuestInt>(
        &self,
        addr: VirtAddr,
        perms: Perm,
    ) -> Result<T, Error> {
        let mut bytes = [0u8; 16];
        self.read_with(addr, &mut bytes[..T::SIZE], perms)?;

        Ok(T::from_le_slice(&bytes[..T::SIZE]))
    }

    /// Compute dirty blocks and bitmap. It does not check if the memory
    /// range is valid.
    fn update_dirty(&mut self, addr: VirtAddr, size: usize) {
        if size == 0 {
            return;
        }

        let block_start = *addr / DIRTY_BLOCK_SIZE;
        // One past the last touched block. Rounding up covers ranges ending
        // exactly on a block boundary.
        let block_end =
            (*addr + size + (DIRTY_BLOCK_SIZE - 1)) / DIRTY_BLOCK_SIZE;

        for block in block_start..block_end {
            let idx = block / 64;
            let bit = block % 64;

            if self.dirty_bitmap[idx] & (1 << bit) == 0 {
                self.dirty_bitmap[idx] |= 1 << bit;
                self.dirty.push(block);
            }
        }
    }
}

/// Primitive integers that cross the guest boundary as little-endian bytes.
pub trait GuestInt: Copy {
    /// Width of the integer in bytes.
    const SIZE: usize;

    /// Decode a value from exactly `SIZE` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Encode the value into exactly `SIZE` little-endian bytes.
    fn to_le_slice(self, out: &mut [u8]);
}

macro_rules! impl_guest_int {
    ($($Ty:ty),* $(,)?) => {
        $(
            impl GuestInt for $Ty {
                const SIZE: usize = mem::size_of::<$Ty>();

                fn from_le_slice(bytes: &[u8]) -> $Ty {
                    <$Ty>::from_le_bytes(bytes.try_into().unwrap())
                }

                fn to_le_slice(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_guest_int!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

#[cfg(test)]
mod tests {
    use super::*;

    const MEM_SIZE: usize = 0x100000;

    /// Checks that the dirty list and the dirty bitmap agree: every listed
    /// block has its bit set, every set bit has exactly one list entry.
    fn check_dirty_consistency(mmu: &Mmu) {
        for &block in &mmu.dirty {
            assert!(
                mmu.dirty_bitmap[block / 64] & (1 << (block % 64)) != 0,
                "block {:#x} listed but not set in bitmap",
                block
            );
        }

        let set_bits: u32 =
            mmu.dirty_bitmap.iter().map(|w| w.count_ones()).sum();
        assert_eq!(set_bits as usize, mmu.dirty.len());

        let mut sorted = mmu.dirty.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), mmu.dirty.len(), "duplicate dirty entries");
    }

    #[test]
    fn mmu_new() {
        let mmu = Mmu::new(0x20000);
        let want = Mmu {
            size: 0x20000,
            memory: vec![0; 0x20000],
            perms: vec![Perm(0); 0x20000],
            dirty: vec![],
            dirty_bitmap: vec![0; 1],
            cur_alc: VirtAddr(ALLOC_BASE),
        };

        assert_eq!(mmu, want);
    }

    #[test]
    #[should_panic]
    fn mmu_new_small_size() {
        Mmu::new(ALLOC_BASE - 1);
    }

    #[test]
    fn mmu_allocate_base() {
        let mut mmu = Mmu::new(MEM_SIZE);
        let addr = mmu.allocate(4).unwrap();

        assert_eq!(addr, VirtAddr(0x10000));
        assert_eq!(mmu.alloc_cursor(), VirtAddr(0x10010));
    }

    #[test]
    fn mmu_allocate_alignment_and_guard() {
        let mut mmu = Mmu::new(MEM_SIZE);
        let first = mmu.allocate(1).unwrap();
        let second = mmu.allocate(1).unwrap();

        assert_eq!(*second - *first, 16);

        // Only the requested byte gets permissions; the padding up to the
        // next allocation keeps none.
        assert_eq!(mmu.perms[*first], Perm(PERM_WRITE | PERM_RAW));
        assert_eq!(mmu.perms[*first + 1], Perm(0));
    }

    #[test]
    fn mmu_allocate_zero() {
        let mut mmu = Mmu::new(MEM_SIZE);
        let cursor = mmu.alloc_cursor();

        assert_eq!(mmu.allocate(0).unwrap(), cursor);
        assert_eq!(mmu.alloc_cursor(), cursor);
        assert_eq!(mmu.dirty_len(), 0);
    }

    #[test]
    fn mmu_allocate_out_of_arena() {
        let mut mmu = Mmu::new(0x20000);

        // 0x10000 + 0x10000 hits the arena end exactly, which is already
        // too much: the last byte is a guard.
        match mmu.allocate(0x10000) {
            Err(Error::OutOfArena { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        // One aligned step smaller fits.
        mmu.allocate(0xffef).unwrap();
    }

    #[test]
    fn mmu_read_uninitialized_traps() {
        let mut mmu = Mmu::new(MEM_SIZE);
        let addr = mmu.allocate(4).unwrap();

        let mut out = [0u8; 4];
        match mmu.read(addr, &mut out) {
            Err(Error::ReadDenied { addr, missing }) => {
                assert_eq!(addr, VirtAddr(0x10000));
                assert_eq!(*missing & PERM_READ, PERM_READ);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn mmu_write_then_read() {
        let mut mmu = Mmu::new(MEM_SIZE);
        let addr = mmu.allocate(4).unwrap();

        mmu.write(addr, b"abcd").unwrap();

        let mut out = [0u8; 4];
        mmu.read(addr, &mut out).unwrap();
        assert_eq!(&out, b"abcd");

        // Every written byte is now readable and writable. RAW may remain
        // set; it only matters before the first write.
        for p in &mmu.perms[*addr..*addr + 4] {
            assert_eq!(**p & (PERM_READ | PERM_WRITE), PERM_READ | PERM_WRITE);
        }
    }

    #[test]
    fn mmu_raw_promotion_partial() {
        let mut mmu = Mmu::new(MEM_SIZE);
        let addr = mmu.allocate(3).unwrap();

        mmu.write(addr, &[1, 2]).unwrap();

        assert_eq!(&mmu.memory[*addr..*addr + 4], &[1, 2, 0, 0]);
        assert_eq!(
            &mmu.perms[*addr..*addr + 4],
            &[
                Perm(PERM_WRITE | PERM_RAW | PERM_READ),
                Perm(PERM_WRITE | PERM_RAW | PERM_READ),
                Perm(PERM_WRITE | PERM_RAW),
                Perm(0)
            ]
        );
    }

    #[test]
    fn mmu_write_denied_no_side_effects() {
        let mut golden = Mmu::new(MEM_SIZE);
        let addr = golden.allocate(8).unwrap();
        // Punch a hole in the middle of the allocation.
        golden.set_perms(VirtAddr(*addr + 4), 1, Perm(0)).unwrap();

        let mut fork = golden.fork();
        match fork.write(addr, &[0x41; 8]) {
            Err(Error::WriteDenied { addr: fault, .. }) => {
                assert_eq!(fault, VirtAddr(*addr + 4));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // Nothing was copied and nothing was dirtied.
        let mut out = [0u8; 8];
        fork.peek(addr, &mut out).unwrap();
        assert_eq!(out, [0u8; 8]);
        assert_eq!(fork.dirty_len(), 0);
    }

    #[test]
    fn mmu_fork_isolation() {
        let mut parent = Mmu::new(MEM_SIZE);
        let addr = parent.allocate(4).unwrap();
        parent.write(addr, b"abcd").unwrap();

        let mut child = parent.fork();
        child.write(addr, b"AAAA").unwrap();

        let mut out = [0u8; 4];
        child.read(addr, &mut out).unwrap();
        assert_eq!(&out, b"AAAA");

        parent.read(addr, &mut out).unwrap();
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn mmu_reset_restores_data_and_perms() {
        let mut parent = Mmu::new(MEM_SIZE);
        let addr = parent.allocate(4).unwrap();
        parent.write(addr, b"abcd").unwrap();

        let mut child = parent.fork();
        child.write(addr, b"AAAA").unwrap();
        child.reset(&parent);

        let mut out = [0u8; 4];
        child.read(addr, &mut out).unwrap();
        assert_eq!(&out, b"abcd");
        assert_eq!(child.dirty_len(), 0);
    }

    #[test]
    fn mmu_reset_restores_raw() {
        let mut parent = Mmu::new(MEM_SIZE);
        let addr = parent.allocate(4).unwrap();

        let mut child = parent.fork();
        child.write(addr, b"AAAA").unwrap();

        let mut out = [0u8; 4];
        child.read(addr, &mut out).unwrap();
        assert_eq!(&out, b"AAAA");

        // The parent never initialized this range, so after the reset it is
        // back to write-only.
        child.reset(&parent);
        match child.read(addr, &mut out) {
            Err(Error::ReadDenied { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn mmu_dirty_granularity() {
        let mut parent = Mmu::new(MEM_SIZE);
        let addr = parent.allocate(4).unwrap();

        let mut child = parent.fork();
        child.write(addr, &[0x41]).unwrap();

        assert_eq!(child.dirty, vec![0x10]);

        // A second write to the same block must not re-append it.
        child.write(VirtAddr(*addr + 1), &[0x42]).unwrap();
        assert_eq!(child.dirty_len(), 1);

        check_dirty_consistency(&child);
    }

    #[test]
    fn mmu_dirty_straddles_blocks() {
        let mut parent = Mmu::new(MEM_SIZE);
        parent.allocate(2 * DIRTY_BLOCK_SIZE).unwrap();

        let mut child = parent.fork();
        let last = VirtAddr(ALLOC_BASE + DIRTY_BLOCK_SIZE - 2);
        child.write(last, &[1, 2, 3, 4]).unwrap();

        assert_eq!(child.dirty_len(), 2);
        check_dirty_consistency(&child);

        child.reset(&parent);
        assert_eq!(child.dirty_len(), 0);

        let mut out = [0u8; 4];
        child.peek(last, &mut out).unwrap();
        assert_eq!(out, [0u8; 4]);
    }

    #[test]
    fn mmu_set_perms_dirties() {
        let parent = Mmu::new(MEM_SIZE);

        let mut child = parent.fork();
        child
            .set_perms(VirtAddr(0x1000), 4, Perm(PERM_READ))
            .unwrap();
        assert_eq!(child.dirty_len(), 1);

        // Permission changes roll back on reset like data writes.
        child.reset(&parent);
        assert_eq!(child.perms[0x1000], Perm(0));
    }

    #[test]
    fn mmu_exec_only_fetch() {
        let mut mmu = Mmu::new(MEM_SIZE);
        mmu.set_alloc_base(VirtAddr(0x12000));

        // Install instruction bytes the way a loader does: writable while
        // copying, then demoted to exec-only.
        let text = VirtAddr(0x11190);
        mmu.set_perms(text, 4, Perm(PERM_WRITE)).unwrap();
        mmu.write(text, &[0x13, 0x05, 0x40, 0x01]).unwrap();
        mmu.set_perms(text, 4, Perm(PERM_EXEC)).unwrap();

        let mut out = [0u8; 4];
        match mmu.read(text, &mut out) {
            Err(Error::ReadDenied { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        mmu.read_with(text, &mut out, Perm(PERM_EXEC)).unwrap();
        assert_eq!(out, [0x13, 0x05, 0x40, 0x01]);
    }

    #[test]
    fn mmu_read_with_requires_all_bits() {
        let mut mmu = Mmu::new(MEM_SIZE);
        mmu.set_alloc_base(VirtAddr(0x12000));

        let addr = VirtAddr(0x11000);
        mmu.set_perms(addr, 4, Perm(PERM_WRITE)).unwrap();
        mmu.write(addr, &[0; 4]).unwrap();
        mmu.set_perms(addr, 4, Perm(PERM_READ)).unwrap();

        // READ alone does not satisfy an EXEC fetch.
        let mut out = [0u8; 4];
        match mmu.read_with(addr, &mut out, Perm(PERM_EXEC)) {
            Err(Error::PermMismatch { addr: fault, expected }) => {
                assert_eq!(fault, addr);
                assert_eq!(expected, Perm(PERM_EXEC));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn mmu_write_allocation_boundary() {
        let mut mmu = Mmu::new(MEM_SIZE);
        let addr = mmu.allocate(16).unwrap();

        // Ends exactly at the high-water mark.
        mmu.write(addr, &[0x41; 16]).unwrap();

        // One byte past it does not.
        match mmu.write(VirtAddr(*addr + 1), &[0x41; 16]) {
            Err(Error::UnallocatedWrite { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn mmu_read_allocation_boundary() {
        let mmu = Mmu::new(MEM_SIZE);

        let mut out = [0u8; 4];
        match mmu.read(mmu.alloc_cursor(), &mut out) {
            Err(Error::UnallocatedRead { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn mmu_zero_length_ops() {
        let mut mmu = Mmu::new(MEM_SIZE);

        // Zero-length accesses succeed unconditionally, even out of bounds.
        mmu.write(VirtAddr(MEM_SIZE + 0x1000), &[]).unwrap();
        let mut out: [u8; 0] = [];
        mmu.read(VirtAddr(MEM_SIZE + 0x1000), &mut out).unwrap();
    }

    #[test]
    fn mmu_out_of_bounds() {
        let mut mmu = Mmu::new(MEM_SIZE);

        match mmu.write(VirtAddr(MEM_SIZE - 2), &[0; 4]) {
            Err(Error::OutOfBounds { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        let mut out = [0u8; 4];
        match mmu.read(VirtAddr(MEM_SIZE), &mut out) {
            Err(Error::OutOfBounds { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        match mmu.set_perms(VirtAddr(MEM_SIZE - 2), 4, Perm(PERM_READ)) {
            Err(Error::OutOfBounds { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn mmu_address_overflow() {
        let mut mmu = Mmu::new(MEM_SIZE);

        match mmu.set_perms(VirtAddr(usize::MAX), 16, Perm(PERM_READ)) {
            Err(Error::OutOfBounds { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        let mut out = [0u8; 16];
        match mmu.read(VirtAddr(usize::MAX), &mut out) {
            Err(Error::OutOfBounds { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn mmu_fork_then_reset_is_noop() {
        let mut parent = Mmu::new(MEM_SIZE);
        let addr = parent.allocate(64).unwrap();
        parent.write(addr, &[0x41; 64]).unwrap();

        let mut child = parent.fork();
        child.reset(&parent);

        assert_eq!(child, parent.fork());
    }

    #[test]
    fn mmu_reset_replays_identically() {
        // Applying the same operations to a fresh fork and to a reset fork
        // must land both in the same state.
        let mut parent = Mmu::new(MEM_SIZE);
        let addr = parent.allocate(32).unwrap();

        let run = |mmu: &mut Mmu| {
            mmu.write(addr, b"snapshot").unwrap();
            mmu.set_perms(VirtAddr(*addr + 8), 4, Perm(PERM_READ)).unwrap();
            let scratch = mmu.allocate(16).unwrap();
            mmu.write_int::<u64>(scratch, 0x1122334455667788).unwrap();
        };

        let mut recycled = parent.fork();
        run(&mut recycled);
        recycled.reset(&parent);
        run(&mut recycled);

        let mut fresh = parent.fork();
        run(&mut fresh);

        assert_eq!(recycled.memory, fresh.memory);
        assert_eq!(recycled.perms, fresh.perms);
        assert_eq!(recycled.cur_alc, fresh.cur_alc);
    }

    #[test]
    #[should_panic]
    fn mmu_reset_size_mismatch() {
        let parent = Mmu::new(MEM_SIZE);
        let mut other = Mmu::new(2 * MEM_SIZE);

        other.reset(&parent);
    }

    #[test]
    fn mmu_set_alloc_base() {
        let mut mmu = Mmu::new(MEM_SIZE);
        mmu.set_alloc_base(VirtAddr(0x20000));

        assert_eq!(mmu.allocate(4).unwrap(), VirtAddr(0x20000));
    }

    #[test]
    #[should_panic]
    fn mmu_set_alloc_base_backwards() {
        let mut mmu = Mmu::new(MEM_SIZE);
        mmu.set_alloc_base(VirtAddr(ALLOC_BASE - 0x1000));
    }

    #[test]
    fn mmu_write_read_int() {
        let mut mmu = Mmu::new(MEM_SIZE);
        let addr = mmu.allocate(64).unwrap();

        mmu.write_int::<u8>(addr, 0x11).unwrap();
        assert_eq!(mmu.read_int::<u8>(addr).unwrap(), 0x11);

        let addr16 = VirtAddr(*addr + 16);
        mmu.write_int::<u16>(addr16, 0x1122).unwrap();
        assert_eq!(mmu.read_int::<u16>(addr16).unwrap(), 0x1122);

        let addr32 = VirtAddr(*addr + 32);
        mmu.write_int::<u32>(addr32, 0x11223344).unwrap();
        assert_eq!(mmu.read_int::<u32>(addr32).unwrap(), 0x11223344);

        let addr64 = VirtAddr(*addr + 40);
        mmu.write_int::<u64>(addr64, 0x1122334455667788).unwrap();
        assert_eq!(mmu.read_int::<u64>(addr64).unwrap(), 0x1122334455667788);

        let addri64 = VirtAddr(*addr + 48);
        mmu.write_int::<i64>(addri64, -42).unwrap();
        assert_eq!(mmu.read_int::<i64>(addri64).unwrap(), -42);
    }

    #[test]
    fn mmu_read_int_with_exec() {
        let mut mmu = Mmu::new(MEM_SIZE);
        mmu.set_alloc_base(VirtAddr(0x12000));

        let text = VirtAddr(0x11000);
        mmu.set_perms(text, 4, Perm(PERM_WRITE)).unwrap();
        mmu.write_int::<u32>(text, 0x0140_0513).unwrap();
        mmu.set_perms(text, 4, Perm(PERM_EXEC)).unwrap();

        let inst = mmu.read_int_with::<u32>(text, Perm(PERM_EXEC)).unwrap();
        assert_eq!(inst, 0x0140_0513);
    }

    #[test]
    fn mmu_poke_peek() {
        let mut mmu = Mmu::new(MEM_SIZE);
        mmu.poke(VirtAddr(0), &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        mmu.peek(VirtAddr(0), &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        // Unchecked writes are invisible to the dirty tracker.
        assert_eq!(mmu.dirty_len(), 0);
    }

    #[test]
    fn perm_display() {
        assert_eq!(format!("{}", Perm(PERM_READ | PERM_WRITE)), "RW-");
        assert_eq!(format!("{}", Perm(PERM_WRITE | PERM_RAW)), "-W-r");
        assert_eq!(format!("{}", Perm(0)), "---");
    }
}
