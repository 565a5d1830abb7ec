//! Session audio loop: drift measurement, correction and delayed emission
//!
//! The loop pulls blocks from the configured source (silence when the
//! source has nothing), measures how far audio leads video and how far
//! the sample position sits from the master clock, and applies bounded
//! corrections before blocks enter the delay buffer. Emission is gated:
//! after a source switch the buffer is purged and held until the
//! requested delay's worth of samples has accumulated again.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::{AudioBlock, AudioSource, SilenceSource};
use crate::codec::AudioEncoder;
use crate::config::SyncTuning;
use crate::constants::{AUDIO_SAMPLE_RATE, SAMPLES_PER_BLOCK};
use crate::error::AudioError;
use crate::session::SessionShared;

/// How long one source read may block before silence substitutes
const SOURCE_TIMEOUT: Duration = Duration::from_millis(20);

/// Delay buffer between correction and emission
///
/// Holds corrected blocks until any pending delay has been satisfied.
/// Shared with [`on_source_switch`](crate::session::MasterClockSession::on_source_switch),
/// which purges it and raises the pending delay.
pub struct DelayBuffer {
    blocks: VecDeque<AudioBlock>,
    buffered_samples: u64,
    pending_delay_samples: u64,
}

impl DelayBuffer {
    pub fn new() -> Self {
        Self {
            blocks: VecDeque::new(),
            buffered_samples: 0,
            pending_delay_samples: 0,
        }
    }

    pub fn push(&mut self, block: AudioBlock) {
        self.buffered_samples += block.frames() as u64;
        self.blocks.push_back(block);
    }

    /// Samples (per channel) currently held
    pub fn buffered_samples(&self) -> u64 {
        self.buffered_samples
    }

    pub fn pending_delay_samples(&self) -> u64 {
        self.pending_delay_samples
    }

    /// Raise the pending delay; keeps the maximum of old and new
    pub fn request_delay(&mut self, samples: u64) {
        if samples > self.pending_delay_samples {
            self.pending_delay_samples = samples;
        }
    }

    /// Discard everything buffered, keeping the pending delay
    pub fn purge(&mut self) {
        self.blocks.clear();
        self.buffered_samples = 0;
    }

    /// Take every block that may be emitted this cycle.
    ///
    /// Returns nothing while a pending delay is unsatisfied; once enough
    /// backlog has accumulated the delay is considered served and emission
    /// resumes.
    pub fn drain_ready(&mut self) -> Vec<AudioBlock> {
        if self.pending_delay_samples > 0 {
            if self.buffered_samples < self.pending_delay_samples {
                return Vec::new();
            }
            self.pending_delay_samples = 0;
        }
        self.buffered_samples = 0;
        self.blocks.drain(..).collect()
    }
}

impl Default for DelayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded per-block correction decided against the master clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    None,
    /// Drop this many frames from the front of the block
    Drop(usize),
    /// Pad this many frames of silence onto the block
    Pad(usize),
}

/// Decide the correction for one block.
///
/// `delta_samples` is the master-clock sample position minus the samples
/// already emitted or buffered: positive means audio is behind the clock,
/// negative means ahead. Inside the dead zone nothing happens; beyond it
/// at most a quarter of the block is dropped, or at most `max_pad` frames
/// of silence are appended.
pub fn plan_correction(delta_samples: i64, block_frames: usize, tuning: &SyncTuning) -> Correction {
    let window = tuning.correction_window_samples();
    if delta_samples > window {
        let cap = block_frames / tuning.max_drop_divisor.max(1);
        let drop = (delta_samples as usize).min(cap);
        if drop > 0 {
            return Correction::Drop(drop);
        }
    } else if delta_samples < -window {
        let pad = ((-delta_samples) as usize).min(tuning.max_pad_samples());
        if pad > 0 {
            return Correction::Pad(pad);
        }
    }
    Correction::None
}

/// Audio leads video by this much, in seconds
pub fn audio_lead_secs(audio_samples_emitted: u64, video_frames: u64, fps: u32) -> f64 {
    audio_samples_emitted as f64 / AUDIO_SAMPLE_RATE as f64
        - video_frames as f64 / fps.max(1) as f64
}

pub(crate) fn run_audio_loop(
    shared: Arc<SessionShared>,
    delay: Arc<Mutex<DelayBuffer>>,
    mut source: Box<dyn AudioSource>,
    mut encoder: Box<dyn AudioEncoder>,
    tuning: SyncTuning,
    fps: u32,
) {
    while shared.running.load(Ordering::Acquire) {
        let mut block = match source.next_block(SOURCE_TIMEOUT) {
            Ok(block) if !block.is_empty() => block,
            Ok(_) => continue,
            Err(AudioError::Timeout) => AudioBlock::silence(SAMPLES_PER_BLOCK),
            Err(e) => {
                // Dead source: swap in paced silence for the rest of the run
                tracing::warn!("audio source failed ({e}), continuing with silence");
                source = Box::new(SilenceSource::new());
                continue;
            }
        };

        let emitted = shared.audio_emitted.load(Ordering::Acquire);
        let video_frames = shared.video_frames.load(Ordering::Acquire);

        // Hold future emission when audio would lead video too far
        let lead = audio_lead_secs(emitted, video_frames, fps);
        if lead > tuning.max_audio_lead_secs() {
            let wanted = (lead * AUDIO_SAMPLE_RATE as f64) as u64;
            let mut delay_guard = delay.lock();
            delay_guard.request_delay(wanted);
            tracing::debug!(
                lead_ms = (lead * 1000.0) as i64,
                pending = delay_guard.pending_delay_samples(),
                "audio leading video, emission held"
            );
        }

        // Per-block correction against the master clock
        let desired = (shared.clock.elapsed() * AUDIO_SAMPLE_RATE as f64) as i64;
        let held = emitted + delay.lock().buffered_samples();
        let delta = desired - held as i64;
        match plan_correction(delta, block.frames(), &tuning) {
            Correction::Drop(frames) => block.drop_front(frames),
            Correction::Pad(frames) => block.pad_silence(frames),
            Correction::None => {}
        }

        let ready = {
            let mut delay_guard = delay.lock();
            delay_guard.push(block);
            delay_guard.drain_ready()
        };

        for block in ready {
            let frames = block.frames() as u64;
            match encoder.encode(&block) {
                Ok(packets) => {
                    for packet in &packets {
                        if let Err(e) = shared.mux.lock().write_audio(packet) {
                            tracing::warn!("audio mux failed: {e}");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("audio encode failed: {e}");
                }
            }
            shared.audio_emitted.fetch_add(frames, Ordering::AcqRel);
        }
    }

    // End of stream: trailing packets out of the encoder
    match encoder.flush() {
        Ok(packets) => {
            for packet in &packets {
                if let Err(e) = shared.mux.lock().write_audio(packet) {
                    tracing::warn!("audio mux failed during flush: {e}");
                }
            }
        }
        Err(e) => tracing::warn!("audio encoder flush failed: {e}"),
    }
}
