//! Headless caster
//!
//! Streams a synthetic moving test pattern to the given target using the
//! supervised delivery path. Useful for verifying ingest settings and
//! encoder selection without the full application around the engine.
//!
//! Usage: livecast <rtmp-url-or-file> [fps] [WxH]

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_av_engine::{
    constants::{DEFAULT_FPS, DEFAULT_HEIGHT, DEFAULT_WIDTH},
    frame::VideoFrame,
    AppConfig, FrameProvider, FrameRateRegistry, PipelineController, StreamSettings, TimerService,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let target = args.next().context("usage: livecast <target> [fps] [WxH]")?;
    let fps: u32 = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("invalid fps")?
        .unwrap_or(DEFAULT_FPS);
    let (width, height) = match args.next() {
        Some(geometry) => {
            let (w, h) = geometry
                .split_once('x')
                .context("geometry must look like 1280x720")?;
            (w.parse().context("bad width")?, h.parse().context("bad height")?)
        }
        None => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
    };

    tracing::info!(target = %target, fps, width, height, "starting livecast");

    let timer = Arc::new(TimerService::new());
    let registry = Arc::new(FrameRateRegistry::new(fps as f64)?);
    let controller = PipelineController::new(AppConfig::load(), timer, Some(registry));

    let settings = StreamSettings {
        target,
        width,
        height,
        fps,
        ..Default::default()
    };
    controller.start(settings, test_pattern_provider())?;

    let mut status_rx = controller.subscribe();
    let status_task = tokio::spawn(async move {
        while let Ok(event) = status_rx.recv().await {
            tracing::info!(status = ?event.status, message = ?event.message, "stream status");
        }
    });

    // Periodic stats until interrupted
    let stats_controller = controller.clone();
    let stats_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
            tracing::info!(
                dropped_frames = stats_controller.dropped_frames(),
                "delivery stats"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, stopping");
    controller.stop();
    status_task.abort();
    stats_task.abort();
    Ok(())
}

/// Moving color bars with a sweeping highlight, animated off wall time
fn test_pattern_provider() -> FrameProvider {
    let started = Instant::now();
    Arc::new(move |width, height, _direct| {
        let t = started.elapsed().as_secs_f64();
        let sweep = ((t * 0.2).fract() * width as f64) as u32;

        let mut data = vec![0u8; VideoFrame::byte_len(width, height)];
        for y in 0..height {
            for x in 0..width {
                let i = ((y * width + x) * 4) as usize;
                let bar = x * 7 / width.max(1);
                let (r, g, b) = match bar {
                    0 => (235, 235, 235),
                    1 => (235, 235, 16),
                    2 => (16, 235, 235),
                    3 => (16, 235, 16),
                    4 => (235, 16, 235),
                    5 => (235, 16, 16),
                    _ => (16, 16, 235),
                };
                let lit = x.abs_diff(sweep) < width / 32;
                data[i] = if lit { 255 } else { r };
                data[i + 1] = if lit { 255 } else { g };
                data[i + 2] = if lit { 255 } else { b };
                data[i + 3] = 0xff;
            }
        }
        Some(VideoFrame::new(bytes::Bytes::from(data), width, height))
    })
}
