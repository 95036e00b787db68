// ABOUTME: Benchmarks for the digest-framed socket path and the deterministic codec stand-in

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dcp_encode_engine::codec::{Codec, DeterministicCodec};
use dcp_encode_engine::socket::fletcher32;
use dcp_encode_engine::types::{PixelFormat, RawImage};

fn bench_fletcher32(c: &mut Criterion) {
    let payload = vec![0x5au8; 8 * 1024 * 1024];
    c.bench_function("fletcher32_8mb", |b| {
        b.iter(|| fletcher32(black_box(&payload)))
    });
}

fn bench_deterministic_codec(c: &mut Criterion) {
    let image = RawImage::new(1998, 1080, PixelFormat::Rgb24, vec![0x11u8; 1998 * 1080 * 3]);
    let codec = DeterministicCodec;
    c.bench_function("deterministic_codec_encode_2k", |b| {
        b.iter(|| codec.encode(black_box(&image)).unwrap())
    });
}

criterion_group!(benches, bench_fletcher32, bench_deterministic_codec);
criterion_main!(benches);
