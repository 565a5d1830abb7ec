//! Source registry and heartbeat
//!
//! Owns the global target rate, one converter per registered source, and
//! the heartbeat that keeps stalled sources emitting. The registry is an
//! owned service object: construct it once at application start and share
//! it by `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::clock::MasterClock;
use crate::error::{Error, Result};
use crate::frame::{TimestampedFrame, VideoFrame};
use crate::rate::converter::FrameRateConverter;
use crate::sched::{TaskHandle, TimerService};

/// Registry of cadence converters keyed by source id
pub struct FrameRateRegistry {
    /// Shared output interval, seconds
    interval: RwLock<f64>,
    converters: DashMap<String, FrameRateConverter>,
    heartbeat: Mutex<Option<TaskHandle>>,
    frames_processed: AtomicU64,
    frames_duplicated: AtomicU64,
}

/// Registry-wide counters
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub frames_processed: u64,
    pub frames_duplicated: u64,
    pub sources: usize,
}

impl FrameRateRegistry {
    pub fn new(target_fps: f64) -> Result<Self> {
        validate_fps(target_fps)?;
        Ok(Self {
            interval: RwLock::new(1.0 / target_fps),
            converters: DashMap::new(),
            heartbeat: Mutex::new(None),
            frames_processed: AtomicU64::new(0),
            frames_duplicated: AtomicU64::new(0),
        })
    }

    /// Register a source; idempotent
    pub fn register(&self, source_id: &str) {
        let interval = *self.interval.read();
        self.converters
            .entry(source_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(source = source_id, "registered input source");
                FrameRateConverter::new(source_id, interval)
            });
    }

    pub fn unregister(&self, source_id: &str) {
        if self.converters.remove(source_id).is_some() {
            tracing::debug!(source = source_id, "unregistered input source");
        }
    }

    /// Offer a frame from a source; registers the source on first contact.
    ///
    /// Returns the stamped frame when the source's next output slot is due.
    pub fn submit(
        &self,
        source_id: &str,
        frame: VideoFrame,
        capture_time: f64,
    ) -> Option<TimestampedFrame> {
        self.register(source_id);
        let out = self
            .converters
            .get_mut(source_id)
            .and_then(|mut conv| conv.submit(frame, capture_time));
        if out.is_some() {
            self.frames_processed.fetch_add(1, Ordering::Relaxed);
        }
        out
    }

    /// One heartbeat pass: synthesize one duplicate per stalled source.
    ///
    /// Called at the frame interval, this yields exactly one duplicate per
    /// missed output slot. Sources that never produced a frame stay silent.
    pub fn heartbeat(&self, now: f64) -> Vec<TimestampedFrame> {
        let mut synthesized = Vec::new();
        for mut entry in self.converters.iter_mut() {
            if entry.is_stalled(now) {
                if let Some(dup) = entry.duplicate() {
                    synthesized.push(dup);
                }
            }
        }
        self.frames_duplicated
            .fetch_add(synthesized.len() as u64, Ordering::Relaxed);
        synthesized
    }

    /// Update the shared target rate and propagate to every converter.
    ///
    /// Rejects non-positive and non-finite rates.
    pub fn set_target_fps(&self, fps: f64) -> Result<()> {
        validate_fps(fps)?;
        let interval = 1.0 / fps;
        *self.interval.write() = interval;
        for mut entry in self.converters.iter_mut() {
            entry.set_interval(interval);
        }
        if let Some(handle) = self.heartbeat.lock().as_ref() {
            handle.set_interval(Duration::from_secs_f64(interval));
        }
        tracing::info!(fps, "target frame rate updated");
        Ok(())
    }

    pub fn frame_interval(&self) -> f64 {
        *self.interval.read()
    }

    pub fn target_fps(&self) -> f64 {
        1.0 / self.frame_interval()
    }

    /// Drive the heartbeat from the shared timer service, delivering
    /// synthesized duplicates into `sink`. Replaces any previous heartbeat
    /// registration; detach with [`detach_heartbeat`](Self::detach_heartbeat).
    pub fn attach_heartbeat(
        registry: &Arc<Self>,
        timer: &TimerService,
        clock: MasterClock,
        sink: Sender<TimestampedFrame>,
    ) {
        let this = registry.clone();
        let registry = Arc::downgrade(registry);
        let handle = timer.register(
            "rate-heartbeat",
            Duration::from_secs_f64(this.frame_interval()),
            move || {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                for dup in registry.heartbeat(clock.elapsed()) {
                    // A full sink means the consumer is behind; shedding the
                    // duplicate is strictly better than stalling the timer.
                    let _ = sink.try_send(dup);
                }
            },
        );
        *this.heartbeat.lock() = Some(handle);
    }

    pub fn detach_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.cancel();
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_duplicated: self.frames_duplicated.load(Ordering::Relaxed),
            sources: self.converters.len(),
        }
    }
}

fn validate_fps(fps: f64) -> Result<()> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(Error::Config(format!("target fps must be positive, got {fps}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_frame() -> VideoFrame {
        VideoFrame::new(Bytes::from(vec![0u8; 16]), 2, 2)
    }

    const FPS: f64 = 30.0;
    const INTERVAL: f64 = 1.0 / FPS;

    #[test]
    fn test_rejects_bad_fps() {
        assert!(FrameRateRegistry::new(0.0).is_err());
        assert!(FrameRateRegistry::new(-30.0).is_err());
        assert!(FrameRateRegistry::new(f64::NAN).is_err());

        let registry = FrameRateRegistry::new(FPS).unwrap();
        assert!(registry.set_target_fps(0.0).is_err());
        assert!(registry.set_target_fps(f64::INFINITY).is_err());
        // unchanged after rejection
        assert!((registry.target_fps() - FPS).abs() < 1e-9);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = FrameRateRegistry::new(FPS).unwrap();
        registry.register("cam1");
        registry.register("cam1");
        assert_eq!(registry.stats().sources, 1);

        registry.unregister("cam1");
        assert_eq!(registry.stats().sources, 0);
    }

    #[test]
    fn test_submit_auto_registers() {
        let registry = FrameRateRegistry::new(FPS).unwrap();
        let out = registry.submit("cam1", test_frame(), INTERVAL);
        assert!(out.is_some());
        assert_eq!(registry.stats().sources, 1);
        assert_eq!(registry.stats().frames_processed, 1);
    }

    #[test]
    fn test_steady_input_yields_no_duplicates() {
        let registry = FrameRateRegistry::new(FPS).unwrap();
        let mut t = 0.0;
        for _ in 0..30 {
            t += INTERVAL;
            registry.submit("cam1", test_frame(), t);
            // Heartbeat runs between frames; nothing should be stalled
            assert!(registry.heartbeat(t + 0.001).is_empty());
        }
        assert_eq!(registry.stats().frames_duplicated, 0);
    }

    #[test]
    fn test_stalled_source_duplicates_once_per_tick() {
        let registry = FrameRateRegistry::new(FPS).unwrap();
        registry.submit("cam1", test_frame(), INTERVAL);

        // Source stalls; heartbeat fires at the frame interval
        let mut dup_total = 0;
        for tick in 1..=5 {
            let now = INTERVAL + (1.5 + tick as f64) * INTERVAL;
            let dups = registry.heartbeat(now);
            assert_eq!(dups.len(), 1, "tick {tick} synthesized {}", dups.len());
            dup_total += dups.len();
        }
        assert_eq!(registry.stats().frames_duplicated as usize, dup_total);
    }

    #[test]
    fn test_silent_source_never_duplicates() {
        let registry = FrameRateRegistry::new(FPS).unwrap();
        registry.register("cam1");
        assert!(registry.heartbeat(100.0).is_empty());
    }

    #[test]
    fn test_heartbeat_runs_on_the_timer_service() {
        let timer = TimerService::new();
        let clock = MasterClock::new();
        let registry = Arc::new(FrameRateRegistry::new(50.0).unwrap());
        let (sink, dups) = crossbeam_channel::unbounded();

        // One real frame, then the source goes quiet
        registry.submit("cam1", test_frame(), clock.elapsed());
        FrameRateRegistry::attach_heartbeat(&registry, &timer, clock, sink);

        // Well past the stall threshold several heartbeat ticks fire
        std::thread::sleep(std::time::Duration::from_millis(200));
        registry.detach_heartbeat();

        let received: Vec<_> = dups.try_iter().collect();
        assert!(
            received.len() >= 3,
            "expected synthesized duplicates, got {}",
            received.len()
        );
        for pair in received.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            assert!(pair[1].target_time > pair[0].target_time);
        }

        // Detached: no further synthesis
        let after = registry.stats().frames_duplicated;
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(registry.stats().frames_duplicated, after);
    }

    #[test]
    fn test_fps_propagates_to_converters() {
        let registry = FrameRateRegistry::new(FPS).unwrap();
        registry.submit("cam1", test_frame(), INTERVAL);

        registry.set_target_fps(60.0).unwrap();
        assert!((registry.frame_interval() - 1.0 / 60.0).abs() < 1e-9);

        // Next emission lands on the new, denser grid
        let out = registry
            .submit("cam1", test_frame(), INTERVAL + 1.0 / 60.0)
            .unwrap();
        assert!((out.target_time - (INTERVAL + 1.0 / 60.0)).abs() < 1e-9);
    }
}
