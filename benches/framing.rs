use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::net::SocketAddr;

use wsdns::framing;

/// Benchmark tagging a query with its source address
fn bench_encode(c: &mut Criterion) {
    let source: SocketAddr = "[2001:db8::1]:53000".parse().unwrap();

    let mut group = c.benchmark_group("framing_encode");
    for size in [64usize, 512, 1500] {
        let payload = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| framing::encode_for(black_box(&source), black_box(payload)))
        });
    }
    group.finish();
}

/// Benchmark splitting a reply and recovering its destination
fn bench_decode(c: &mut Criterion) {
    let source: SocketAddr = "127.0.0.1:40000".parse().unwrap();

    let mut group = c.benchmark_group("framing_decode");
    for size in [64usize, 512, 2048] {
        let message = framing::encode_for(&source, &vec![0x01u8; size]);
        group.throughput(Throughput::Bytes(message.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| {
                let (key, payload) = framing::decode(black_box(message)).unwrap();
                (framing::parse_correlation_key(key).unwrap(), payload.len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
