//! Codec benchmarks for parlor-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parlor_protocol::{codec, ChatMessage, Frame};

fn delivered(len: usize) -> Frame {
    Frame::delivered(ChatMessage {
        id: "0192d0b8-5a7e-7c3a-9f1e-3b6f2d4c8a10".to_string(),
        room_id: "general".to_string(),
        user_id: "42".to_string(),
        display_name: "alice".to_string(),
        content: "x".repeat(len),
        created_at: 1_700_000_000_000,
    })
}

fn bench_encode(c: &mut Criterion) {
    let frame = delivered(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("msgpack_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode_json(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = delivered(64);
    let encoded = codec::encode(&frame).unwrap();
    let text = codec::encode_json(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::decode_json(black_box(&text)))
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
