//! Codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sphere_protocol::{codec, ChatMessage, ServerEvent, UserId};

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    let event = ServerEvent::ReceiveMessage(ChatMessage::new(
        UserId::new(),
        UserId::new(),
        "x".repeat(256),
    ));

    group.throughput(Throughput::Elements(1));

    group.bench_function("json_encode", |b| {
        b.iter(|| codec::to_json(black_box(&event)).unwrap());
    });

    let text = codec::to_json(&event).unwrap();
    group.bench_function("json_decode", |b| {
        b.iter(|| codec::from_json::<ServerEvent>(black_box(&text)).unwrap());
    });

    group.bench_function("msgpack_encode", |b| {
        b.iter(|| codec::encode(black_box(&event)).unwrap());
    });

    let encoded = codec::encode(&event).unwrap();
    group.bench_function("msgpack_decode", |b| {
        b.iter(|| codec::decode::<ServerEvent>(black_box(&encoded)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
