//! Benchmarks for the record and rollup paths.
//!
//! Run with: `cargo bench -p tally -- rollup`

#![allow(missing_docs, clippy::cast_possible_wrap)]

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tally::{Event, Period, Store};
use tempfile::tempdir;

const BASE: i64 = 1_393_762_211;

/// Events spread over `names` three-level names and one hour.
fn events(count: usize, names: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            Event::counter(
                format!("svc.endpoint{}.status{}", i % names, i % 3),
                1.0,
                Some(BASE + (i % 3600) as i64),
            )
        })
        .collect()
}

fn bench_record_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_batch");

    for count in [100, 1_000, 10_000] {
        let batch = events(count, 30);
        group.bench_with_input(BenchmarkId::from_parameter(count), &batch, |b, batch| {
            b.iter_batched(
                || Store::open_in_memory().unwrap(),
                |mut store| store.record_batch(black_box(batch)).unwrap(),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollup/aggregate");

    for count in [1_000, 10_000] {
        let batch = events(count, 30);
        group.bench_with_input(BenchmarkId::from_parameter(count), &batch, |b, batch| {
            b.iter_batched(
                || {
                    let mut store = Store::open_in_memory().unwrap();
                    store.record_batch(batch).unwrap();
                    store
                },
                |mut store| store.aggregate(black_box(&Period::DEFAULT)).unwrap(),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_merge_into_existing(c: &mut Criterion) {
    // File-backed, so WAL and synchronous=NORMAL are in effect
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path().join("bench.db")).unwrap();
    store.record_batch(&events(10_000, 30)).unwrap();
    store.aggregate(&[]).unwrap();

    let increment = events(1_000, 30);
    c.bench_function("rollup/merge_1000_into_existing", |b| {
        b.iter(|| {
            store.record_batch(&increment).unwrap();
            black_box(store.aggregate(&[]).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_record_batch,
    bench_aggregate,
    bench_merge_into_existing
);
criterion_main!(benches);
