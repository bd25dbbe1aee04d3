//! Benchmarks for stream write/read throughput and directory lookups

use coffer::{CompoundFile, Version};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn benchmark_stream_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_write");

    for size in [4 * 1024usize, 64 * 1024, 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let payload = vec![0xA5u8; size];
            b.iter(|| {
                let mut cf = CompoundFile::create(Version::V3);
                let mut root = cf.root_storage().unwrap();
                let mut stream = root.add_stream("bench").unwrap();
                stream.write_at(0, black_box(&payload)).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_stream_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_read");

    for size in [64 * 1024usize, 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut cf = CompoundFile::create(Version::V3);
            {
                let mut root = cf.root_storage().unwrap();
                let mut stream = root.add_stream("bench").unwrap();
                stream.write_at(0, &vec![0x5Au8; size]).unwrap();
            }

            let mut buf = vec![0u8; size];
            b.iter(|| {
                let mut root = cf.root_storage().unwrap();
                let mut stream = root.stream("bench").unwrap();
                let n = stream.read_at(0, black_box(&mut buf)).unwrap();
                assert_eq!(n, size);
            });
        });
    }

    group.finish();
}

fn benchmark_directory_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("directory_lookup");

    for count in [100usize, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let mut cf = CompoundFile::create(Version::V3);
            let mut root = cf.root_storage().unwrap();
            for i in 0..count {
                root.add_stream(&format!("Entry{:05}", i)).unwrap();
            }
            b.iter(|| {
                let mut root = cf.root_storage().unwrap();
                black_box(root.stream("Entry00042").unwrap().sid());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_stream_write,
    benchmark_stream_read,
    benchmark_directory_lookup
);
criterion_main!(benches);
