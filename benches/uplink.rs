use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use live_voice_session::audio::AudioFrame;
use live_voice_session::codec::{DownlinkDecoder, UplinkEncoder};
use live_voice_session::protocol::ClientMessage;

fn sine_frame(len: usize) -> AudioFrame {
    let samples = (0..len)
        .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 16_000.0).sin() * 0.8)
        .collect();
    AudioFrame::new(samples, 16_000)
}

fn bench_encode(c: &mut Criterion) {
    let encoder = UplinkEncoder::new(16_000);
    let mut group = c.benchmark_group("uplink_encode");

    for len in [1024usize, 4096] {
        let frame = sine_frame(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &frame, |b, frame| {
            b.iter(|| encoder.encode(black_box(frame)))
        });
    }
    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let encoder = UplinkEncoder::new(16_000);
    let (chunk, _) = encoder.encode(&sine_frame(4096));

    c.bench_function("uplink_envelope_4096", |b| {
        b.iter(|| ClientMessage::audio(black_box(&chunk)).to_json())
    });
}

fn bench_decode(c: &mut Criterion) {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    // Half a second of reply audio
    let data = BASE64.encode(vec![0x10u8; 24_000]);
    let mut decoder = DownlinkDecoder::new(24_000);

    c.bench_function("downlink_decode_12000", |b| {
        b.iter(|| decoder.decode_inline("audio/pcm;rate=24000", black_box(&data)))
    });
}

criterion_group!(benches, bench_encode, bench_envelope, bench_decode);
criterion_main!(benches);
