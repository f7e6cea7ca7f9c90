//! Wire codec benchmark suite.
//!
//! Benchmarks encoding and incremental decoding of common packets:
//! - PUBLISH payload sizes: 16 B, 1 KiB, 64 KiB
//! - Acknowledgement streams delivered in 1 KiB reads
//!
//! Run with: cargo bench --bench codec
//! Results saved to: target/criterion/

use std::hint::black_box;

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use mqtt_link::protocol::{PacketCodec, decode, encode_to};
use mqtt_link::{Packet, PacketId, Publish, QoS};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_SIZES: &[usize] = &[16, 1024, 64 * 1024];
const ACK_BATCH: u16 = 1000;
const READ_SIZE: usize = 1024;

fn publish(size: usize) -> Packet {
    let id = PacketId::new(42).unwrap();
    Packet::Publish(Publish::new(
        "sensors/site-1/temperature",
        vec![0xA5; size],
        QoS::AtLeastOnce,
        false,
        Some(id),
    ))
}

// ============================================================================
// Benchmark: Encode
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_publish");

    for &size in PAYLOAD_SIZES {
        let packet = publish(size);
        let mut buffer = BytesMut::with_capacity(size + 64);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &packet, |b, packet| {
            b.iter(|| {
                buffer.clear();
                encode_to(black_box(packet), &mut buffer).unwrap();
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Decode
// ============================================================================

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_publish");

    for &size in PAYLOAD_SIZES {
        let mut bytes = BytesMut::new();
        encode_to(&publish(size), &mut bytes).unwrap();
        let bytes = bytes.freeze();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| decode(black_box(bytes), usize::MAX).unwrap());
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Chunked Ack Stream
// ============================================================================

fn bench_ack_stream(c: &mut Criterion) {
    let mut stream = BytesMut::new();
    for n in 1..=ACK_BATCH {
        let id = PacketId::new(n).unwrap();
        encode_to(&Packet::PubAck(id), &mut stream).unwrap();
    }
    let stream = stream.freeze();

    c.bench_function("decode_ack_stream", |b| {
        b.iter(|| {
            let mut codec = PacketCodec::default();
            let mut decoded = 0usize;
            for chunk in stream.chunks(READ_SIZE) {
                codec.extend(chunk);
                while let Some(packet) = codec.next_packet().unwrap() {
                    black_box(packet);
                    decoded += 1;
                }
            }
            assert_eq!(decoded, usize::from(ACK_BATCH));
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_ack_stream);
criterion_main!(benches);
