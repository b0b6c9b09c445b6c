//! Codec benchmarks for braid-protocol.

use braid_protocol::{codec, multipart, Message, OpId, Queue};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

fn data_dump(keys: u64) -> Message {
    let mut queue = Queue::new();
    for i in 0..keys {
        queue
            .insertions
            .push((format!("key:{i}"), OpId::new(i, 1), json!({"value": i})));
    }
    Message::data_dump(queue, Vec::new())
}

fn bench_encode_dump(c: &mut Criterion) {
    let message = data_dump(100);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(100));
    group.bench_function("data_dump_100", |b| {
        b.iter(|| codec::encode(black_box(&message)))
    });
    group.finish();
}

fn bench_decode_dump(c: &mut Criterion) {
    let encoded = codec::encode(&data_dump(100)).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("data_dump_100", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_multipart_split(c: &mut Criterion) {
    let encoded = codec::encode(&data_dump(10_000)).unwrap();

    c.bench_function("multipart_split_64k", |b| {
        b.iter(|| multipart::split(black_box(&encoded), 64 * 1024).unwrap())
    });
}

criterion_group!(
    benches,
    bench_encode_dump,
    bench_decode_dump,
    bench_multipart_split
);
criterion_main!(benches);
