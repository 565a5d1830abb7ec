//! Per-source frame-rate conversion
//!
//! Converts arbitrarily-timed input frames into a steady cadence by
//! emitting on an ideal grid of `last_output + interval` slots. An
//! adaptive threshold derived from recent inter-frame jitter decides how
//! early an input frame may claim its slot. Output times are always the
//! grid slot, never the capture time, so scheduled emission never drifts
//! no matter how jittery the input is.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::frame::{TimestampedFrame, VideoFrame};

/// Samples of inter-frame gap history kept per source
pub const GAP_HISTORY: usize = 30;

/// Gap samples required before the adaptive threshold kicks in
const MIN_GAP_SAMPLES: usize = 5;

/// Gap samples the variance is computed over
const VARIANCE_WINDOW: usize = 10;

/// Floor for the adaptive threshold, seconds (2 ms)
const MIN_ADAPTIVE_THRESHOLD: f64 = 0.002;

/// A stall is declared after this many intervals without output
pub const STALL_FACTOR: f64 = 1.5;

/// Converts one source's input timing to the shared output cadence
pub struct FrameRateConverter {
    source_id: Arc<str>,
    /// Target output interval, seconds
    interval: f64,
    /// Last grid slot an output was emitted for (0 until the first emission)
    last_output_time: f64,
    /// Recent inter-arrival gaps, newest last
    gaps: VecDeque<f64>,
    /// Most recent payload, kept for duplication
    last_frame: Option<VideoFrame>,
    sequence: u64,
    frames_emitted: u64,
    frames_duplicated: u64,
}

impl FrameRateConverter {
    pub fn new(source_id: &str, interval: f64) -> Self {
        Self {
            source_id: Arc::from(source_id),
            interval,
            last_output_time: 0.0,
            gaps: VecDeque::with_capacity(GAP_HISTORY),
            last_frame: None,
            sequence: 0,
            frames_emitted: 0,
            frames_duplicated: 0,
        }
    }

    /// Offer an input frame captured at `capture_time` (master-clock seconds).
    ///
    /// Returns a stamped frame when the next grid slot is due, otherwise the
    /// payload is only cached. The emitted `target_time` is the grid slot.
    pub fn submit(&mut self, frame: VideoFrame, capture_time: f64) -> Option<TimestampedFrame> {
        self.last_frame = Some(frame.clone());

        if self.last_output_time > 0.0 {
            if self.gaps.len() == GAP_HISTORY {
                self.gaps.pop_front();
            }
            self.gaps.push_back(capture_time - self.last_output_time);
        }

        let expected_next = self.last_output_time + self.interval;
        if capture_time < expected_next - self.threshold() {
            // Observed, not yet due
            return None;
        }

        self.last_output_time = expected_next;
        self.frames_emitted += 1;
        Some(self.stamp(frame, capture_time, expected_next))
    }

    /// Synthesize a duplicate of the last payload at the next grid slot.
    ///
    /// `None` until at least one real frame has been seen. Advances the
    /// grid so repeated duplication stays monotonic.
    pub fn duplicate(&mut self) -> Option<TimestampedFrame> {
        let frame = self.last_frame.clone()?;
        let target = self.last_output_time + self.interval;
        self.last_output_time = target;
        self.frames_duplicated += 1;
        Some(self.stamp(frame, target, target))
    }

    /// Whether the source has gone quiet past the stall threshold
    pub fn is_stalled(&self, now: f64) -> bool {
        self.last_frame.is_some() && now - self.last_output_time > STALL_FACTOR * self.interval
    }

    pub fn set_interval(&mut self, interval: f64) {
        self.interval = interval;
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn source_id(&self) -> &Arc<str> {
        &self.source_id
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn frames_duplicated(&self) -> u64 {
        self.frames_duplicated
    }

    /// Timing variance of recent arrivals, milliseconds (lower is steadier)
    pub fn jitter_ms(&self) -> f64 {
        self.variance() * 1000.0
    }

    fn stamp(&mut self, frame: VideoFrame, capture_time: f64, target_time: f64) -> TimestampedFrame {
        let sequence = self.sequence;
        self.sequence += 1;
        TimestampedFrame {
            frame,
            capture_time,
            target_time,
            sequence,
            source_id: self.source_id.clone(),
        }
    }

    /// How early a frame may claim the next grid slot.
    ///
    /// With enough history: twice the recent variance, floored at 2 ms.
    /// Before that: a fixed 10% of the interval.
    fn threshold(&self) -> f64 {
        if self.gaps.len() > MIN_GAP_SAMPLES {
            (2.0 * self.variance()).max(MIN_ADAPTIVE_THRESHOLD)
        } else {
            self.interval * 0.1
        }
    }

    fn variance(&self) -> f64 {
        let window: Vec<f64> = self
            .gaps
            .iter()
            .rev()
            .take(VARIANCE_WINDOW)
            .copied()
            .collect();
        if window.len() < 2 {
            return 0.0;
        }
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        window.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / (window.len() - 1) as f64
    }
}
