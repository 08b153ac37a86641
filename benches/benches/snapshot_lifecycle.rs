//! Benchmarks for full prepare/commit/rollback cycles.

#![allow(missing_docs)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use snapshotter::infrastructure::config::StorageSettings;
use snapshotter::{DiffId, NaiveSnapshotter};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};

fn open_store(root: &std::path::Path, sync_writes: bool) -> NaiveSnapshotter {
    NaiveSnapshotter::new(&StorageSettings {
        sync_writes,
        ..StorageSettings::with_root(root)
    })
    .unwrap()
}

fn bench_commit_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_lifecycle/commit");
    group.sample_size(20);

    for sync_writes in [false, true] {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(&temp_dir.path().join("store"), sync_writes);
        let counter = AtomicUsize::new(0);

        group.bench_with_input(
            BenchmarkId::from_parameter(if sync_writes { "durable" } else { "fast" }),
            &sync_writes,
            |b, _| {
                b.iter(|| {
                    let n = counter.fetch_add(1, Ordering::Relaxed);
                    let dst = temp_dir.path().join(format!("checkout-{n}"));
                    store.prepare(&dst, None).unwrap();
                    fs::write(dst.join("file.txt"), "content").unwrap();
                    store.commit(&DiffId::new(format!("layer-{n}")).unwrap(), &dst).unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_prepare_from_parent(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_lifecycle/prepare_rollback");

    let temp_dir = tempfile::tempdir().unwrap();
    let store = open_store(&temp_dir.path().join("store"), false);
    let base_dst = temp_dir.path().join("base");
    store.prepare(&base_dst, None).unwrap();
    for i in 0..200 {
        fs::write(base_dst.join(format!("file{i}.txt")), "x".repeat(512)).unwrap();
    }
    let base = DiffId::new("base").unwrap();
    store.commit(&base, &base_dst).unwrap();

    let dst = temp_dir.path().join("work");
    group.bench_function("200_files", |b| {
        b.iter(|| {
            store.prepare(&dst, Some(&base)).unwrap();
            store.rollback(&dst).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_commit_cycle, bench_prepare_from_parent);
criterion_main!(benches);
