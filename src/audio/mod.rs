//! Audio capture, pacing and block-level sample operations
//!
//! Everything downstream of a source works in one domain: interleaved
//! stereo i16 at 48 kHz. Sources hide where the samples come from (a
//! capture device, a media file demuxed through ffmpeg, or synthesized
//! silence) behind [`AudioSource`], and each one paces delivery close to
//! real time so the session's drift corrections stay small.

pub mod device;
pub mod media;
pub mod resample;

use std::time::{Duration, Instant};

use crate::constants::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE, SAMPLES_PER_BLOCK};
use crate::error::AudioError;

pub use device::DeviceSource;
pub use media::MediaFileSource;
pub use resample::LinearResampler;

/// A block of interleaved stereo i16 samples at 48 kHz
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBlock {
    samples: Vec<i16>,
}

impl AudioBlock {
    /// Wrap interleaved stereo samples; the length must be channel-aligned
    pub fn new(samples: Vec<i16>) -> Self {
        debug_assert_eq!(samples.len() % AUDIO_CHANNELS as usize, 0);
        Self { samples }
    }

    /// A silent block of `frames` samples per channel
    pub fn silence(frames: usize) -> Self {
        Self {
            samples: vec![0; frames * AUDIO_CHANNELS as usize],
        }
    }

    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / AUDIO_CHANNELS as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / AUDIO_SAMPLE_RATE as f64
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Drop `frames` samples per channel from the front (skip-ahead)
    pub fn drop_front(&mut self, frames: usize) {
        let n = (frames * AUDIO_CHANNELS as usize).min(self.samples.len());
        self.samples.drain(..n);
    }

    /// Append `frames` samples per channel of silence
    pub fn pad_silence(&mut self, frames: usize) {
        self.samples
            .resize(self.samples.len() + frames * AUDIO_CHANNELS as usize, 0);
    }

    /// Little-endian byte view for raw s16le consumers
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// A paced 48 kHz stereo sample source
///
/// `next_block` blocks for at most roughly `timeout`. A source that has
/// nothing to deliver returns an error; callers substitute silence rather
/// than stalling.
pub trait AudioSource: Send {
    fn next_block(&mut self, timeout: Duration) -> Result<AudioBlock, AudioError>;
}

/// Synthesized silence, paced to real time
///
/// Tracks its own sample position against a wall-clock anchor so the blocks
/// it produces arrive at the same rate a real device would deliver them.
pub struct SilenceSource {
    started: Instant,
    frames_produced: u64,
}

impl SilenceSource {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            frames_produced: 0,
        }
    }
}

impl Default for SilenceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for SilenceSource {
    fn next_block(&mut self, _timeout: Duration) -> Result<AudioBlock, AudioError> {
        let due = self.started
            + Duration::from_secs_f64(self.frames_produced as f64 / AUDIO_SAMPLE_RATE as f64);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
        self.frames_produced += SAMPLES_PER_BLOCK as u64;
        Ok(AudioBlock::silence(SAMPLES_PER_BLOCK))
    }
}
