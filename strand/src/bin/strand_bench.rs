//! Scheduler and queue throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin strand_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0   Pin the SPSC producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2   Pin the SPSC consumer to CPU 2 (default: 2)
//!     STRAND_WORKERS   Worker count for the scheduler benches
//!     STRAND_MAX_LOCAL_JOBS, STRAND_PIN_WORKERS   See `RuntimeConfig::from_env`

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use strand::{Runtime, RuntimeConfig, Timeout, spsc};

const SPSC_ITERATIONS: u64 = 1 << 24;
const JOBS: usize = 1 << 20;
const SERIAL_JOBS: usize = 1 << 18;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn report(name: &str, ops: u64, start: Instant) {
    let elapsed = start.elapsed();
    let ns_per_op = elapsed.as_nanos() as f64 / ops as f64;
    let mops = ops as f64 / elapsed.as_secs_f64() / 1e6;
    println!("{name:<24} {ops:>10} ops  {ns_per_op:>8.2} ns/op  {mops:>8.2} Mops/s");
}

fn bench_spsc(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (tx, rx) = spsc::channel::<u64>();

    let consumer = thread::spawn(move || {
        pin_to_cpu(consumer_cpu);
        let mut sum = 0u64;
        for _ in 0..SPSC_ITERATIONS {
            if let Some(v) = rx.pop_blocking(Timeout::Infinite) {
                sum = sum.wrapping_add(v);
            }
        }
        hint::black_box(sum)
    });

    pin_to_cpu(producer_cpu);
    let start = Instant::now();
    for i in 0..SPSC_ITERATIONS {
        tx.push(i);
    }
    let sum = consumer.join().unwrap();
    report("spsc push/pop", SPSC_ITERATIONS, start);

    assert_eq!(sum, SPSC_ITERATIONS * (SPSC_ITERATIONS - 1) / 2);
}

fn bench_for_each(runtime: &Runtime) {
    let total = AtomicU64::new(0);

    let start = Instant::now();
    runtime.for_each(JOBS, |i| {
        total.fetch_add(i as u64, Ordering::Relaxed);
    });
    report("for_each", JOBS as u64, start);

    let n = JOBS as u64;
    assert_eq!(total.load(Ordering::Relaxed), n * (n - 1) / 2);
}

fn bench_serial_queue(runtime: &Runtime) {
    let q = runtime.queue_create();
    let counter = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    for _ in 0..SERIAL_JOBS {
        let counter = Arc::clone(&counter);
        runtime.queue(Some(&q), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }
    runtime.queue_destroy(q, true);
    report("serial queue", SERIAL_JOBS as u64, start);

    assert_eq!(counter.load(Ordering::Relaxed), SERIAL_JOBS as u64);
}

fn main() {
    strand::init_tracing();

    let (producer_cpu, consumer_cpu) = get_cpu_affinity();
    println!("producer cpu: {producer_cpu:?}, consumer cpu: {consumer_cpu:?}");
    bench_spsc(producer_cpu, consumer_cpu);

    let config = RuntimeConfig::from_env();
    println!(
        "workers: {}, max_local_jobs: {}",
        config.workers, config.max_local_jobs
    );
    let runtime = match Runtime::spawn(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    bench_for_each(&runtime);
    bench_serial_queue(&runtime);

    let stats = runtime.stats();
    println!(
        "executed: {}, stolen: {}, inlined: {}, panicked: {}, main jobs: {}",
        stats.executed, stats.stolen, stats.inlined, stats.panicked, stats.main_jobs
    );
    runtime.shutdown();
}
