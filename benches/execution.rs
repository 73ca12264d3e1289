//! Benchmark for serial versus parallel scheduling of intkey workloads.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use exec_harness::{Executor, ParallelExecutor, SerialExecutor, Workload, WorkloadConfig};

/// Benchmarks both strategies at different conflict factors.
fn bench_conflict_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution/conflict_levels");

    let conflict_factors = [0.0, 0.25, 0.5, 0.75, 1.0];
    let executors: [Box<dyn Executor>; 2] = [
        Box::new(SerialExecutor::new()),
        Box::new(ParallelExecutor::new(4)),
    ];

    for &conflict_factor in &conflict_factors {
        let config = WorkloadConfig {
            num_keys: 1000,
            num_batches: 100,
            txns_per_batch: 4,
            conflict_factor,
            invalid_rate: 0.0,
            seed: 42,
        };

        // Pre-generate the workload outside the benchmark loop.
        let workload = Workload::generate(config).expect("workload generation failed");
        group.throughput(Throughput::Elements(workload.num_transactions() as u64));

        for executor in &executors {
            group.bench_with_input(
                BenchmarkId::new(executor.name(), format!("conflict_{:.0}%", conflict_factor * 100.0)),
                &workload,
                |b, workload| {
                    b.iter(|| {
                        executor
                            .execute(black_box(workload))
                            .map(|result| result.valid_batches)
                            .unwrap_or(0)
                    });
                },
            );
        }
    }

    group.finish();
}

/// Benchmarks the parallel strategy with different worker counts.
fn bench_worker_counts(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution/worker_counts");

    let workload = Workload::generate(WorkloadConfig {
        num_keys: 10_000,
        num_batches: 100,
        txns_per_batch: 4,
        conflict_factor: 0.0,
        invalid_rate: 0.0,
        seed: 42,
    })
    .expect("workload generation failed");
    group.throughput(Throughput::Elements(workload.num_transactions() as u64));

    for &num_workers in &[1, 2, 4, 8] {
        let executor = ParallelExecutor::new(num_workers);
        group.bench_with_input(
            BenchmarkId::new("parallel", num_workers),
            &workload,
            |b, workload| {
                b.iter(|| {
                    executor
                        .execute(black_box(workload))
                        .map(|result| result.valid_batches)
                        .unwrap_or(0)
                });
            },
        );
    }

    group.finish();
}

/// Benchmarks the cost of rejected batches.
fn bench_invalid_rates(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution/invalid_rates");

    for &invalid_rate in &[0.0, 0.05, 0.2] {
        let workload = Workload::generate(WorkloadConfig {
            num_keys: 1000,
            num_batches: 100,
            txns_per_batch: 4,
            conflict_factor: 0.5,
            invalid_rate,
            seed: 42,
        })
        .expect("workload generation failed");
        let executor = ParallelExecutor::new(4);

        group.throughput(Throughput::Elements(workload.num_transactions() as u64));
        group.bench_with_input(
            BenchmarkId::new("parallel", format!("invalid_{:.0}%", invalid_rate * 100.0)),
            &workload,
            |b, workload| {
                b.iter(|| {
                    executor
                        .execute(black_box(workload))
                        .map(|result| result.invalid_batches)
                        .unwrap_or(0)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_conflict_levels,
    bench_worker_counts,
    bench_invalid_rates
);
criterion_main!(benches);
