//! Benchmarks for the recursive copy behind prepare and commit.
//!
//! Performance-critical paths:
//! - `copy_dir`: many small files (source trees, package metadata)
//! - `copy_dir`: few large files (binaries, archives)

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use snapshotter::snapshot::copy::{copy_dir, CopyOptions};
use std::fs;
use std::path::Path;

fn populate(root: &Path, files: usize, size: usize) {
    let content: Vec<u8> = (0..size).map(|i| u8::try_from(i % 251).unwrap()).collect();
    for i in 0..files {
        let dir = root.join(format!("dir{}", i % 16));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("file{i}.bin")), &content).unwrap();
    }
}

fn bench_copy_small_files(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_copy/small_files");

    for files in [10usize, 100, 1000] {
        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().join("src");
        populate(&src, files, 1024);

        group.throughput(Throughput::Elements(files as u64));
        group.bench_with_input(BenchmarkId::from_parameter(files), &files, |b, _| {
            b.iter_with_setup(
                || tempfile::tempdir().unwrap(),
                |dst| copy_dir(black_box(&src), &dst.path().join("copy"), CopyOptions::default()),
            );
        });
    }

    group.finish();
}

fn bench_copy_large_files(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_copy/large_files");
    group.sample_size(20);

    for size in [1_048_576usize, 10_485_760] {
        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().join("src");
        populate(&src, 4, size);

        group.throughput(Throughput::Bytes((size * 4) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}_bytes")),
            &size,
            |b, _| {
                b.iter_with_setup(
                    || tempfile::tempdir().unwrap(),
                    |dst| copy_dir(black_box(&src), &dst.path().join("copy"), CopyOptions::default()),
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_copy_small_files, bench_copy_large_files);
criterion_main!(benches);
