//! Benchmarks for the realtime hot paths: ring store/fetch, format conversion and Opus encode.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sdr_opus_audio::{
    audio::{
        convert::{ConvertStatus, InputStatus},
        FormatConverter, RingBuffer, SampleFormat, SourceBuffer, StreamFormat,
    },
    codec::OpusEncoder,
    config::{OpusConfig, WireFormat},
};

/// 440 Hz tone, interleaved
fn tone(frames: usize, channels: usize, sample_rate: f32) -> Vec<f32> {
    (0..frames)
        .flat_map(|i| {
            let s = (i as f32 * 440.0 * std::f32::consts::TAU / sample_rate).sin() * 0.5;
            std::iter::repeat(s).take(channels)
        })
        .collect()
}

fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");
    for frames in [240usize, 480, 960] {
        let ring = RingBuffer::with_capacity(2, 20 * 960).unwrap();
        let src = tone(frames, 2, 48_000.0);
        let mut dst = vec![0.0; frames * 2];
        let mut at = 0u64;

        group.bench_with_input(BenchmarkId::new("store_fetch", frames), &frames, |b, &frames| {
            b.iter(|| {
                ring.store(black_box(&src), frames, at).unwrap();
                ring.fetch(black_box(&mut dst), frames, at).unwrap();
                at += frames as u64;
            })
        });
    }
    group.finish();
}

fn bench_convert(c: &mut Criterion) {
    let mut group = c.benchmark_group("convert");
    let wire = WireFormat::default();
    let destination = StreamFormat::intermediate(&wire);

    for (rate, channels) in [(24_000u32, 2u16), (48_000, 1), (44_100, 2)] {
        let source = StreamFormat {
            sample_rate: rate,
            channels,
            sample_format: SampleFormat::F32,
            interleaved: true,
        };
        let mut converter = FormatConverter::new(source, destination, wire.frame_size).unwrap();
        let input = tone(converter.input_frames_max(), channels as usize, rate as f32);
        let mut output = vec![0.0; converter.block_samples()];

        group.bench_function(BenchmarkId::new("block", format!("{rate}Hz_{channels}ch")), |b| {
            b.iter(|| {
                let status = converter
                    .convert(&mut output, |needed| {
                        InputStatus::HaveData(SourceBuffer::F32(&input[..needed * channels as usize]))
                    })
                    .unwrap();
                assert_eq!(status, ConvertStatus::HaveData);
                black_box(&output);
            })
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let wire = WireFormat::default();
    let mut encoder = OpusEncoder::new(&wire, &OpusConfig::default()).unwrap();
    let frame = tone(wire.frame_size, wire.channels as usize, wire.sample_rate as f32);

    c.bench_function("opus_encode_frame", |b| {
        b.iter(|| black_box(encoder.encode(black_box(&frame)).unwrap().len()))
    });
}

criterion_group!(benches, bench_ring, bench_convert, bench_encode);
criterion_main!(benches);
