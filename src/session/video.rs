//! Session video loop: anchored schedule, counter-based PTS
//!
//! The loop holds an anchored `next_tick` on the master clock and sleeps
//! in short increments until each slot is due, so scheduling error never
//! accumulates. The frame counter is the canonical video timeline: it
//! advances only when a frame actually enters the encoder.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::VideoEncoder;
use crate::frame::FrameProvider;
use crate::session::SessionShared;

/// Longest single sleep while waiting for the next slot
const TICK_SLEEP: Duration = Duration::from_millis(2);

pub(crate) fn run_video_loop(
    shared: Arc<SessionShared>,
    provider: FrameProvider,
    mut encoder: Box<dyn VideoEncoder>,
    width: u32,
    height: u32,
    fps: u32,
) {
    let period = 1.0 / fps.max(1) as f64;
    let mut next_tick = shared.clock.elapsed();

    while shared.running.load(Ordering::Acquire) {
        let now = shared.clock.elapsed();
        if now < next_tick {
            let remaining = Duration::from_secs_f64(next_tick - now);
            std::thread::sleep(remaining.min(TICK_SLEEP));
            continue;
        }
        next_tick += period;

        let Some(frame) = provider(width, height, false) else {
            // Nothing composable this instant; the slot passes unused
            continue;
        };
        let frame = if frame.matches(width, height) {
            frame
        } else {
            frame.fit_to(width, height)
        };

        match encoder.encode(&frame) {
            Ok(packets) => {
                for packet in &packets {
                    if let Err(e) = shared.mux.lock().write_video(packet) {
                        tracing::warn!("video mux failed: {e}");
                    }
                }
                shared.video_frames.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                tracing::warn!("video encode failed: {e}");
            }
        }
    }

    // End of stream: trailing packets out of the encoder
    match encoder.flush() {
        Ok(packets) => {
            for packet in &packets {
                if let Err(e) = shared.mux.lock().write_video(packet) {
                    tracing::warn!("video mux failed during flush: {e}");
                }
            }
        }
        Err(e) => tracing::warn!("video encoder flush failed: {e}"),
    }
}
