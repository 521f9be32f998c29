//! Benchmarks for broadcast partition planning.
//!
//! Run with: `cargo bench -p mailpulse-broadcasts`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use mailpulse_broadcasts::{batches, plan_partitions};

fn bench_plan_partitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_partitions");

    for variants in [1usize, 2, 5] {
        let weights: Vec<(usize, u32)> = (0..variants).map(|i| (i, (90 / variants) as u32)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(variants), &weights, |b, weights| {
            b.iter(|| plan_partitions(black_box(weights), black_box(1_000_000)).unwrap());
        });
    }

    group.finish();
}

fn bench_batches(c: &mut Criterion) {
    let plan = plan_partitions(&[(0usize, 20), (1, 30)], 1_000_000).unwrap();

    c.bench_function("batch_final_sample_500", |b| {
        b.iter(|| batches(black_box(plan.final_sample), 500).count());
    });
}

criterion_group!(benches, bench_plan_partitions, bench_batches);
criterion_main!(benches);
