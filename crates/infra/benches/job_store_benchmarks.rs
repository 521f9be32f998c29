use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use mailpulse_infra::jobs::{
    InMemoryJobStore, Job, JobExecutor, JobExecutorConfig, JobRegistry, JobResult, JobStore,
    LeaseRequest, NewJob, DEFAULT_LEASE,
};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn new_jobs(n: usize) -> Vec<NewJob> {
    (0..n)
        .map(|i| NewJob::new("bench.noop", "bench", serde_json::json!({ "n": i })))
        .collect()
}

fn bench_dispatch_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_dispatch");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let store = InMemoryJobStore::new();
                b.iter(|| {
                    rt.block_on(async {
                        black_box(store.dispatch_many(new_jobs(batch_size)).await.unwrap());
                    })
                });
            },
        );
    }
    group.finish();
}

fn bench_find_and_lease(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_find_and_lease");

    // Candidate selection scans the whole table, so the backlog size matters.
    for backlog in [100, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &backlog| {
            let types = vec!["bench.noop".to_string()];
            b.iter_batched(
                || {
                    let store = InMemoryJobStore::new();
                    rt.block_on(store.dispatch_many(new_jobs(backlog))).unwrap();
                    store
                },
                |store| {
                    rt.block_on(async {
                        let now = chrono::Utc::now();
                        let candidates = store.find_candidates("bench", &types, 10, now).await.unwrap();
                        let timeout_at = now + chrono::Duration::from_std(DEFAULT_LEASE).unwrap();
                        let requests: Vec<LeaseRequest> = candidates
                            .iter()
                            .map(|job| LeaseRequest {
                                job_id: job.id,
                                timeout_at,
                            })
                            .collect();
                        black_box(store.lease(&requests, now).await.unwrap());
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_executor_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("executor_drain");
    group.sample_size(20);

    let mut registry = JobRegistry::new();
    registry.register_fn("bench.noop", |_job: Job| async { Ok(JobResult::success()) });
    let registry = Arc::new(registry);

    for jobs in [100, 1_000].iter() {
        group.throughput(Throughput::Elements(*jobs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), jobs, |b, &jobs| {
            b.iter_batched(
                || {
                    let store = InMemoryJobStore::arc();
                    rt.block_on(store.dispatch_many(new_jobs(jobs))).unwrap();
                    JobExecutor::new(
                        store,
                        registry.clone(),
                        JobExecutorConfig::default()
                            .with_queues(["bench"])
                            .with_concurrency(50),
                    )
                },
                |executor| {
                    rt.block_on(async {
                        black_box(executor.drain(usize::MAX).await.unwrap());
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_dispatch_throughput,
    bench_find_and_lease,
    bench_executor_drain
);
criterion_main!(benches);
