use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;

use tabula_sync::WireMessage;

fn wire_encode_benchmark(c: &mut Criterion) {
    let message = WireMessage::sync(Uuid::new_v4(), &vec![0xabu8; 4096]);
    c.bench_function("wire_encode_binary", |b| {
        b.iter(|| black_box(&message).encode().unwrap())
    });
}

fn wire_decode_benchmark(c: &mut Criterion) {
    let encoded = WireMessage::sync(Uuid::new_v4(), &vec![0xabu8; 4096])
        .encode()
        .unwrap();
    c.bench_function("wire_decode_binary", |b| {
        b.iter(|| WireMessage::decode(black_box(&encoded)).unwrap())
    });
}

fn wire_json_benchmark(c: &mut Criterion) {
    let message = WireMessage::sync(Uuid::new_v4(), &vec![0xabu8; 4096]);
    c.bench_function("wire_encode_json", |b| {
        b.iter(|| black_box(&message).to_json().unwrap())
    });
}

criterion_group!(
    benches,
    wire_encode_benchmark,
    wire_decode_benchmark,
    wire_json_benchmark
);
criterion_main!(benches);
