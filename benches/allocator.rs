//! Allocator benchmarks for viewarena
//!
//! These benchmarks measure the operations a cache performs on every request:
//!
//! - Sequential allocation (free-arena hint fast path)
//! - Fetch of a live handle (window already mapped)
//! - Allocate/free churn that forces coalescing and compaction
//! - Fetches spread over more windows than may be mapped at once
//!
//! ```bash
//! cargo bench --bench allocator
//! cargo bench --bench allocator -- churn
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;
use viewarena::ArenaStore;

const WINDOW_SIZE: u32 = 1024 * 1024;

fn store(max_open: usize) -> ArenaStore {
    ArenaStore::builder()
        .window_size(WINDOW_SIZE)
        .initial_windows(4)
        .max_open_windows(max_open)
        .open()
        .unwrap()
}

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate");

    for size in [64usize, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64 * 1000));
        group.bench_with_input(BenchmarkId::new("sequential", size), size, |b, &size| {
            let payload = vec![0xA5u8; size];
            b.iter_with_setup(
                || store(8),
                |store| {
                    for _ in 0..1000 {
                        black_box(store.allocate(&payload).unwrap());
                    }
                    store
                },
            );
        });
    }

    group.bench_function("file_backed", |b| {
        let payload = vec![0x5Au8; 256];
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let store = ArenaStore::builder()
                    .path(dir.path().join("bench.arena"))
                    .window_size(WINDOW_SIZE)
                    .initial_windows(2)
                    .open()
                    .unwrap();
                (dir, store)
            },
            |(dir, store)| {
                for _ in 0..1000 {
                    black_box(store.allocate(&payload).unwrap());
                }
                (dir, store)
            },
        );
    });

    group.finish();
}

fn bench_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch");

    let store = store(8);
    let handles: Vec<_> = (0..1000)
        .map(|i| store.allocate(&vec![i as u8; 200]).unwrap())
        .collect();

    group.throughput(Throughput::Elements(handles.len() as u64));
    group.bench_function("open_window", |b| {
        b.iter(|| {
            for handle in &handles {
                black_box(store.fetch(*handle).unwrap());
            }
        });
    });

    let paging = ArenaStore::builder()
        .window_size(64 * 1024)
        .initial_windows(1)
        .max_open_windows(2)
        .open()
        .unwrap();
    let spread: Vec<_> = (0..64)
        .map(|i| paging.allocate(&vec![i as u8; 60 * 1024]).unwrap())
        .collect();

    group.throughput(Throughput::Elements(spread.len() as u64));
    group.bench_function("evicting", |b| {
        b.iter(|| {
            for handle in &spread {
                black_box(paging.fetch(*handle).unwrap());
            }
        });
    });

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");

    group.bench_function("allocate_free_mixed", |b| {
        let store = store(4);
        let mut rng = fastrand::Rng::with_seed(17);
        let mut live = Vec::new();

        b.iter(|| {
            for _ in 0..1000 {
                if live.len() < 512 && rng.bool() {
                    let len = rng.usize(16..4096);
                    live.push(store.allocate(&vec![1u8; len]).unwrap());
                } else if !live.is_empty() {
                    let handle = live.swap_remove(rng.usize(..live.len()));
                    store.free(handle).unwrap();
                }
            }
        });
    });

    group.bench_function("defragment_window", |b| {
        b.iter_with_setup(
            || {
                let store = store(1);
                let handles: Vec<_> = (0..2000)
                    .map(|i| store.allocate(&vec![i as u8; 300]).unwrap())
                    .collect();
                for handle in handles.iter().step_by(2) {
                    store.free(*handle).unwrap();
                }
                store
            },
            |store| {
                black_box(store.defragment(0).unwrap());
                store
            },
        );
    });

    group.finish();
}

criterion_group!(benches, bench_allocate, bench_fetch, bench_churn);
criterion_main!(benches);
