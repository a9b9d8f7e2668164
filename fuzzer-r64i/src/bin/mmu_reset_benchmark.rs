//! Micro-benchmark for the fork and reset paths of the guest MMU.

use std::time::Instant;

use rv64_vm::mmu::Mmu;

const NUM_ITER: usize = 1000;

fn bench_mmu_fork() -> f64 {
    let mmu = Mmu::new(4 * 1024 * 1024);

    let start = Instant::now();

    for _ in 0..NUM_ITER {
        mmu.fork();
    }

    NUM_ITER as f64 / start.elapsed().as_secs_f64()
}

fn bench_mmu_reset() -> f64 {
    let mut golden = Mmu::new(1024 * 1024);
    let addr = golden.allocate(4096).unwrap();

    let mut fork = golden.fork();

    let start = Instant::now();

    // Dirty one block per iteration, then restore it.
    for _ in 0..NUM_ITER {
        fork.write(addr, &[0x41; 4096]).unwrap();
        fork.reset(&golden);
    }

    NUM_ITER as f64 / start.elapsed().as_secs_f64()
}

fn main() {
    println!("bench_mmu_fork:  {:12.2} ops", bench_mmu_fork());
    println!("bench_mmu_reset: {:12.2} ops", bench_mmu_reset());
}
