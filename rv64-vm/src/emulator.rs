//! Emulated system: couples an MMU with segment-based program loading and
//! snapshot plumbing. Instruction decoding lives elsewhere; this layer only
//! materializes the golden state and hands out forks.

use std::fs;
use std::io;
use std::path::Path;

use log::debug;
use thiserror::Error;

use crate::mmu::{self, Mmu, Perm, VirtAddr, PERM_WRITE};

/// Emulator error.
#[derive(Debug, Error)]
pub enum VmError {
    /// A section references file bytes outside the program image.
    #[error("section at {0} falls outside the program image")]
    InvalidSection(VirtAddr),

    /// Memory error while materializing a segment.
    #[error("memory error: {0}")]
    Mmu(#[from] mmu::Error),

    /// IO error while reading the program image.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A loadable program segment.
///
/// Section tables are produced externally (e.g. copied from the output of
/// `readelf -l`); parsing object files is not this crate's job.
#[derive(Debug, Clone, Copy)]
pub struct Section {
    /// Offset of the segment data within the program image.
    pub file_offset: usize,

    /// Guest address the segment is mapped at.
    pub virt_addr: VirtAddr,

    /// Size of the segment data within the program image.
    pub file_size: usize,

    /// Total size of the segment in memory. The tail past `file_size` is
    /// zero-filled.
    pub mem_size: usize,

    /// Permissions the segment runs with once loaded.
    pub perms: Perm,
}

/// Emulated system. It owns the guest memory of one emulator instance.
pub struct Emulator {
    /// Memory space of the emulator.
    memory: Mmu,
}

impl Emulator {
    /// Returns a new emulator using `mmu` as its memory space.
    pub fn new(mmu: Mmu) -> Emulator {
        Emulator { memory: mmu }
    }

    /// Returns a shared reference to the guest memory.
    pub fn mmu(&self) -> &Mmu {
        &self.memory
    }

    /// Returns an exclusive reference to the guest memory.
    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.memory
    }

    /// Returns a copy of the emulator. The copy sees the current state as
    /// its snapshot.
    pub fn fork(&self) -> Emulator {
        Emulator {
            memory: self.memory.fork(),
        }
    }

    /// Restores the emulator to the state of `other`.
    pub fn reset(&mut self, other: &Emulator) {
        self.memory.reset(&other.memory);
    }

    /// Load a program image into the guest address space using the given
    /// section table. Intended for golden-state initialization, before any
    /// forks exist.
    ///
    /// Each section is mapped writable while its contents are copied in,
    /// zero-filled past the file-backed part, then demoted to its final
    /// permissions. The allocation cursor is advanced past every loaded
    /// segment, so the program ends up below the high-water mark.
    pub fn load<P: AsRef<Path>>(
        &mut self,
        path: P,
        sections: &[Section],
    ) -> Result<(), VmError> {
        let contents = fs::read(path)?;

        for section in sections {
            let section_end = section
                .virt_addr
                .checked_add(section.mem_size)
                .ok_or(VmError::InvalidSection(section.virt_addr))?;

            // Writes must stay below the allocation cursor, so move the
            // cursor past the segment first.
            let aligned_end = (section_end + 0xf) & !0xf;
            if aligned_end > *self.memory.alloc_cursor() {
                self.memory.set_alloc_base(VirtAddr(aligned_end));
            }

            self.memory.set_perms(
                section.virt_addr,
                section.mem_size,
                Perm(PERM_WRITE),
            )?;

            let file_end = section
                .file_offset
                .checked_add(section.file_size)
                .ok_or(VmError::InvalidSection(section.virt_addr))?;
            let file_bytes = contents
                .get(section.file_offset..file_end)
                .ok_or(VmError::InvalidSection(section.virt_addr))?;
            self.memory.write(section.virt_addr, file_bytes)?;

            // Zero-fill the part of the segment with no file backing.
            if section.mem_size > section.file_size {
                let padding = vec![0u8; section.mem_size - section.file_size];
                self.memory.write(
                    VirtAddr(*section.virt_addr + section.file_size),
                    &padding,
                )?;
            }

            self.memory.set_perms(
                section.virt_addr,
                section.mem_size,
                section.perms,
            )?;

            debug!(
                "mapped segment {}..{} perms {}",
                section.virt_addr,
                VirtAddr(section_end),
                section.perms
            );
        }

        Ok(())
    }
}
