//! Benchmarks concurrent `reserve` contention on a single fresh key
//! against the in-memory store — the hot path exercised by every
//! worker racing to claim the same step.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use durable_steps::{InMemoryStepStore, StepStore};
use tokio::runtime::Runtime;

fn bench_concurrent_reserve(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("concurrent_reserve");

    for workers in [2usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async move {
                let store: Arc<dyn StepStore> = Arc::new(InMemoryStepStore::new());
                let mut handles = Vec::with_capacity(workers);
                for i in 0..workers {
                    let store = store.clone();
                    handles.push(tokio::spawn(async move {
                        store
                            .reserve("wf", "k", "k", &format!("w{i}"), 3_000)
                            .await
                            .unwrap()
                    }));
                }
                for h in handles {
                    let _ = h.await.unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_concurrent_reserve);
criterion_main!(benches);
