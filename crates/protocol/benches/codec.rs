//! Benchmarks for frame chunking and reassembly
//!
//! Measures encode/decode throughput for frame sizes typical of compressed
//! screen captures, at full-speed and high-speed bulk packet sizes.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use bytes::Bytes;
use protocol::{Frame, FrameDecoder, WireChunk, encode};

const FRAME_SIZES: [usize; 3] = [16 * 1024, 256 * 1024, 2 * 1024 * 1024];
const PACKET_SIZES: [usize; 2] = [64, 512];

fn benchmark_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in FRAME_SIZES {
        let frame = Frame::new(1, vec![0xA5u8; size]);
        group.throughput(Throughput::Bytes(size as u64));

        for packet in PACKET_SIZES {
            group.bench_with_input(
                BenchmarkId::new(format!("packet_{}", packet), size),
                &frame,
                |b, frame| b.iter(|| encode(black_box(frame), packet).unwrap()),
            );
        }
    }

    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for size in FRAME_SIZES {
        let frame = Frame::new(1, vec![0x5Au8; size]);
        let wire: Vec<Bytes> = encode(&frame, 512)
            .unwrap()
            .iter()
            .map(WireChunk::to_bytes)
            .collect();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("packet_512", size), &wire, |b, wire| {
            b.iter(|| {
                let mut decoder = FrameDecoder::default();
                let mut frames = Vec::new();
                for buf in wire {
                    frames.extend(decoder.push(black_box(buf)));
                }
                frames
            })
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_encode, benchmark_decode);
criterion_main!(benches);
