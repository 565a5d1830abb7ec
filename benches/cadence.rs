use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};

use live_av_engine::frame::VideoFrame;
use live_av_engine::rate::FrameRateConverter;

fn bench_submit(c: &mut Criterion) {
    c.bench_function("converter_submit_steady_60fps", |b| {
        let frame = VideoFrame::new(Bytes::from(vec![0u8; 64]), 4, 4);
        b.iter_batched(
            || FrameRateConverter::new("bench", 1.0 / 60.0),
            |mut conv| {
                let mut t = 0.0;
                for _ in 0..1000 {
                    t += 1.0 / 60.0;
                    let _ = conv.submit(frame.clone(), t);
                }
                conv
            },
            criterion::BatchSize::SmallInput,
        );
    });

    c.bench_function("converter_submit_jittery_input", |b| {
        let frame = VideoFrame::new(Bytes::from(vec![0u8; 64]), 4, 4);
        b.iter_batched(
            || FrameRateConverter::new("bench", 1.0 / 60.0),
            |mut conv| {
                let mut t = 0.0;
                for i in 0..1000u32 {
                    // Deterministic jitter around the nominal interval
                    t += 1.0 / 60.0 + ((i % 7) as f64 - 3.0) * 0.002;
                    let _ = conv.submit(frame.clone(), t);
                }
                conv
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_submit);
criterion_main!(benches);
