//! Snapshot fuzzer for the r64i test target.
//!
//! A golden emulator is built once by loading the target's segments and
//! allocating the guest input buffer. One worker per thread forks the golden
//! state, then loops: reset, build a mutated case, drive it through the
//! guest memory access gate, and classify any fault it trips.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::info;

use rv64_vm::emulator::{Emulator, Section};
use rv64_vm::mmu::{
    self, Mmu, Perm, VirtAddr, PERM_EXEC, PERM_READ, PERM_WRITE,
};

/// Number of worker threads to spawn.
const NUM_THREADS: usize = 8;

/// Memory size of the VM.
const VM_MEM_SIZE: usize = 1024 * 1024;

/// Target program image.
const TARGET_PATH: &str = "test-targets/r64i_test_app";

/// Entry point of the target's text segment.
const ENTRY_POINT: VirtAddr = VirtAddr(0x11190);

/// Size of the guest input buffer.
const INPUT_SIZE: usize = 4096;

/// Cycles each worker spends on a batch before updating the global stats.
const BATCH_CYCLES: u64 = 500_000_000;

/// Section table of the target, taken from the output of `readelf -l`.
const SECTIONS: [Section; 3] = [
    Section {
        file_offset: 0x0,
        virt_addr: VirtAddr(0x10000),
        file_size: 0x190,
        mem_size: 0x190,
        perms: Perm(PERM_READ),
    },
    Section {
        file_offset: 0x190,
        virt_addr: VirtAddr(0x11190),
        file_size: 0x2598,
        mem_size: 0x2598,
        perms: Perm(PERM_READ | PERM_EXEC),
    },
    Section {
        file_offset: 0x2728,
        virt_addr: VirtAddr(0x14728),
        file_size: 0xf8,
        mem_size: 0x750,
        perms: Perm(PERM_READ | PERM_WRITE),
    },
];

/// Returns the current value of the Timestamp Counter.
fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Xorshift pseudorandom number generator.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Rng {
        // The all-zeroes state is a fixed point, keep away from it.
        Rng(seed | 1)
    }

    fn rand(&mut self) -> usize {
        let val = self.0;

        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;

        val as usize
    }
}

/// Fault classification used for triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FaultKind {
    /// Access outside the guest address space, or allocator exhaustion.
    Bounds,

    /// Access past the allocation high-water mark.
    Unallocated,

    /// Read of non-readable or uninitialized memory.
    Read,

    /// Write to non-writable memory.
    Write,

    /// Instruction fetch from non-executable memory.
    Fetch,
}

impl From<&mmu::Error> for FaultKind {
    fn from(err: &mmu::Error) -> FaultKind {
        match err {
            mmu::Error::OutOfBounds { .. } | mmu::Error::OutOfArena { .. } => {
                FaultKind::Bounds
            }
            mmu::Error::UnallocatedRead { .. }
            | mmu::Error::UnallocatedWrite { .. } => FaultKind::Unallocated,
            mmu::Error::ReadDenied { .. } => FaultKind::Read,
            mmu::Error::WriteDenied { .. } => FaultKind::Write,
            mmu::Error::PermMismatch { .. } => FaultKind::Fetch,
        }
    }
}

/// Returns the faulting guest address carried by `err`.
fn fault_addr(err: &mmu::Error) -> VirtAddr {
    match *err {
        mmu::Error::OutOfBounds { addr, .. }
        | mmu::Error::UnallocatedRead { addr, .. }
        | mmu::Error::UnallocatedWrite { addr, .. }
        | mmu::Error::ReadDenied { addr, .. }
        | mmu::Error::WriteDenied { addr, .. }
        | mmu::Error::PermMismatch { addr, .. } => addr,
        mmu::Error::OutOfArena { .. } => VirtAddr(0),
    }
}

/// Statistics recorded during the fuzzing session.
#[derive(Default)]
struct Stats {
    /// Total number of fuzz cases.
    fuzz_cases: u64,

    /// Total number of faults reported by the access gate.
    faults: u64,

    /// Total number of CPU cycles.
    total_cycles: u64,

    /// Total number of CPU cycles spent resetting the guest.
    reset_cycles: u64,

    /// Total number of CPU cycles spent running cases.
    run_cycles: u64,
}

/// One fuzzer instance. Each worker owns one, along with its private fork
/// of the golden emulator.
struct Fuzzer {
    /// Golden snapshot every case is reset to.
    golden: Emulator,

    /// Working emulator, forked from the golden snapshot.
    emu: Emulator,

    /// Guest address of the input buffer.
    input_addr: VirtAddr,

    /// Global statistics.
    stats: Arc<Mutex<Stats>>,

    /// Global set of unique faults, keyed by faulting address and kind.
    unique_faults: Arc<Mutex<HashSet<(VirtAddr, FaultKind)>>>,

    /// Random number generator.
    rng: Rng,
}

impl Fuzzer {
    /// Returns a new fuzzer instance wrapping the golden emulator.
    fn new(
        golden: Emulator,
        input_addr: VirtAddr,
        stats: Arc<Mutex<Stats>>,
        unique_faults: Arc<Mutex<HashSet<(VirtAddr, FaultKind)>>>,
    ) -> Fuzzer {
        let emu = golden.fork();

        Fuzzer {
            golden,
            emu,
            input_addr,
            stats,
            unique_faults,
            rng: Rng::new(0x5273e95b7c721b5a),
        }
    }

    /// Returns a copy of the fuzzer instance with its own golden snapshot
    /// and working fork.
    fn fork(&self) -> Fuzzer {
        Fuzzer {
            golden: self.golden.fork(),
            emu: self.golden.fork(),
            input_addr: self.input_addr,
            stats: Arc::clone(&self.stats),
            unique_faults: Arc::clone(&self.unique_faults),
            rng: Rng::new(0x5273e95b7c721b5a ^ rdtsc()),
        }
    }

    /// Builds this case's input: random contents, usually aimed at the
    /// input buffer, sometimes deliberately misplaced so the access gate
    /// has something to catch.
    fn next_case(&mut self) -> (VirtAddr, Vec<u8>) {
        let len = 1 + self.rng.rand() % INPUT_SIZE;
        let mut data = vec![0u8; len];
        for byte in data.iter_mut() {
            *byte = self.rng.rand() as u8;
        }

        let addr = match self.rng.rand() % 16 {
            // Step past the end of the input buffer.
            0 => VirtAddr(*self.input_addr + INPUT_SIZE),
            // Land in the middle of the text segment.
            1 => ENTRY_POINT,
            _ => self.input_addr,
        };

        (addr, data)
    }

    /// Runs a single fuzz case against the working emulator.
    fn run_case(
        &mut self,
        addr: VirtAddr,
        data: &[u8],
    ) -> Result<(), mmu::Error> {
        self.emu.mmu_mut().write(addr, data)?;

        // Fetch a window at the entry point the way the CPU front-end
        // would.
        let mut window = [0u8; 16];
        self.emu
            .mmu()
            .read_with(ENTRY_POINT, &mut window, Perm(PERM_EXEC))?;

        // Drain the input back through the read gate.
        let mut out = vec![0u8; data.len()];
        self.emu.mmu().read(addr, &mut out)?;

        // Scratch allocation, the way a guest-side malloc would behave.
        let scratch = self.emu.mmu_mut().allocate(32)?;
        self.emu.mmu_mut().write_int::<u64>(scratch, data.len() as u64)?;

        Ok(())
    }

    /// Records a fault in the global set.
    fn record_fault(&self, err: &mmu::Error) {
        let key = (fault_addr(err), FaultKind::from(err));
        let is_new = self.unique_faults.lock().unwrap().insert(key);

        if is_new {
            info!("new fault: {}", err);
        }
    }

    /// Starts the worker. Normally, one fuzzer per core is spawned.
    fn go(mut self) {
        loop {
            let batch_start = rdtsc();
            let mut local = Stats::default();

            // Update global stats once per batch to keep lock contention
            // off the hot loop.
            while rdtsc() - batch_start < BATCH_CYCLES {
                let reset_start = rdtsc();
                self.emu.reset(&self.golden);
                local.reset_cycles += rdtsc() - reset_start;

                let (addr, data) = self.next_case();

                let run_start = rdtsc();
                let result = self.run_case(addr, &data);
                local.run_cycles += rdtsc() - run_start;

                if let Err(err) = result {
                    local.faults += 1;
                    self.record_fault(&err);

                    // Reset never moves the allocation cursor back, so a
                    // long-lived fork eventually exhausts the bump
                    // allocator. Start over from the golden snapshot.
                    if let mmu::Error::OutOfArena { .. } = err {
                        self.emu = self.golden.fork();
                    }
                }

                local.fuzz_cases += 1;
            }

            local.total_cycles = rdtsc() - batch_start;

            let mut stats = self.stats.lock().unwrap();
            stats.fuzz_cases += local.fuzz_cases;
            stats.faults += local.faults;
            stats.total_cycles += local.total_cycles;
            stats.reset_cycles += local.reset_cycles;
            stats.run_cycles += local.run_cycles;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let mut golden = Emulator::new(Mmu::new(VM_MEM_SIZE));
    golden
        .load(TARGET_PATH, &SECTIONS)
        .with_context(|| format!("could not load {}", TARGET_PATH))?;

    let input_addr = golden
        .mmu_mut()
        .allocate(INPUT_SIZE)
        .context("could not allocate the input buffer")?;

    info!("loaded {}, input buffer at {}", TARGET_PATH, input_addr);

    let stats = Arc::new(Mutex::new(Stats::default()));
    let unique_faults = Arc::new(Mutex::new(HashSet::new()));

    let fuzzer = Fuzzer::new(
        golden,
        input_addr,
        Arc::clone(&stats),
        Arc::clone(&unique_faults),
    );

    for _ in 0..NUM_THREADS {
        let fuzzer = fuzzer.fork();
        thread::spawn(move || fuzzer.go());
    }

    // Show statistics in the main thread.
    let start = Instant::now();
    let mut last_fuzz_cases = 0;

    loop {
        thread::sleep(Duration::from_millis(1000));

        let stats = stats.lock().unwrap();
        let unique = unique_faults.lock().unwrap().len();

        let elapsed = start.elapsed().as_secs_f64();
        let fcps = stats.fuzz_cases as f64 / elapsed;
        let reset_time = stats.reset_cycles as f64 / stats.total_cycles as f64;
        let run_time = stats.run_cycles as f64 / stats.total_cycles as f64;

        println!(
            "[{elapsed:10.4}] cases {cases:10} | fcps (last) {last_fcps:10} | \
            fcps {fcps:10.1} | faults {faults:8} | unique {unique:5} | \
            reset {reset_time:6.4} | run {run_time:6.4}",
            elapsed = elapsed,
            cases = stats.fuzz_cases,
            last_fcps = stats.fuzz_cases - last_fuzz_cases,
            fcps = fcps,
            faults = stats.faults,
            unique = unique,
            reset_time = reset_time,
            run_time = run_time,
        );

        last_fuzz_cases = stats.fuzz_cases;
    }
}
