//! Linear-interpolation resampler for capture rates other than 48 kHz

use crate::constants::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};

/// Streaming linear resampler for interleaved stereo i16
///
/// Keeps a fractional read position and the final frame of the previous
/// block, so consecutive blocks resample without seams.
pub struct LinearResampler {
    /// Input frames consumed per output frame
    step: f64,
    /// Fractional read position into the pending input, in frames
    pos: f64,
    /// Carried final frame of the previous input block
    carry: Option<[i16; 2]>,
}

impl LinearResampler {
    pub fn new(input_rate: u32) -> Self {
        Self {
            step: input_rate as f64 / AUDIO_SAMPLE_RATE as f64,
            pos: 0.0,
            carry: None,
        }
    }

    /// Whether this resampler actually changes the rate
    pub fn is_identity(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    /// Resample one interleaved stereo block to the 48 kHz domain
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.is_identity() && self.carry.is_none() {
            return input.to_vec();
        }

        let ch = AUDIO_CHANNELS as usize;
        // Prepend the carried frame for cross-block interpolation
        let mut frames: Vec<[i16; 2]> = Vec::with_capacity(input.len() / ch + 1);
        if let Some(carry) = self.carry.take() {
            frames.push(carry);
        }
        for f in input.chunks_exact(ch) {
            frames.push([f[0], f[1]]);
        }
        if frames.len() < 2 {
            self.carry = frames.pop();
            return Vec::new();
        }

        let mut out = Vec::new();
        while self.pos + 1.0 < frames.len() as f64 {
            let idx = self.pos as usize;
            let frac = self.pos - idx as f64;
            for c in 0..ch {
                let a = frames[idx][c] as f64;
                let b = frames[idx + 1][c] as f64;
                out.push((a + (b - a) * frac).round() as i16);
            }
            self.pos += self.step;
        }

        // Keep the final frame; rebase the position relative to it
        self.pos -= (frames.len() - 1) as f64;
        self.carry = Some(frames[frames.len() - 1]);
        out
    }
}
