//! Engine configuration
//!
//! `StreamSettings` is the per-start parameter set handed to the engine by
//! the host application; `AppConfig` is machine-level configuration loaded
//! from a TOML file. The empirically tuned synchronization constants live
//! in `SyncTuning` so deployments can adjust them without rebuilding.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{AUDIO_SAMPLE_RATE, DEFAULT_FPS, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::error::{Error, Result};

/// Tunable A/V synchronization heuristics with their production defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncTuning {
    /// Audio may lead video by at most this much before emission is held
    pub max_audio_lead_ms: u64,
    /// Dead zone around the master clock before drop/pad corrections apply
    pub correction_window_ms: u64,
    /// Cap on silence padded into a single block
    pub max_pad_ms: u64,
    /// At most 1/N of a block's samples are dropped per correction
    pub max_drop_divisor: usize,
    /// Delay applied after a program source switch
    pub switch_delay_ms: u64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            max_audio_lead_ms: 200,
            correction_window_ms: 5,
            max_pad_ms: 10,
            max_drop_divisor: 4,
            switch_delay_ms: 150,
        }
    }
}

impl SyncTuning {
    pub fn max_audio_lead_secs(&self) -> f64 {
        self.max_audio_lead_ms as f64 / 1000.0
    }

    pub fn correction_window_samples(&self) -> i64 {
        ms_to_samples(self.correction_window_ms) as i64
    }

    pub fn max_pad_samples(&self) -> usize {
        ms_to_samples(self.max_pad_ms) as usize
    }

    pub fn switch_delay_samples(&self) -> u64 {
        ms_to_samples(self.switch_delay_ms)
    }
}

/// Samples per channel for a span of milliseconds at 48 kHz
pub fn ms_to_samples(ms: u64) -> u64 {
    ms * AUDIO_SAMPLE_RATE as u64 / 1000
}

/// Session start parameters supplied by the host application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// RTMP-class URL or local output path
    pub target: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Explicit bitrate; computed from resolution and rate when absent
    pub bitrate_kbps: Option<u32>,
    /// Encoder preference by name; probed selection when absent
    pub codec: Option<String>,
    /// x264 preset for the software path
    pub preset: String,
    pub capture_audio: bool,
    /// Capture device identifier; empty means the default device
    pub audio_device: String,
    /// Positive delays audio, negative delays video (milliseconds)
    pub av_sync_delay_ms: i64,
    /// Mux audio demuxed from this media file instead of a device
    pub media_audio_path: Option<PathBuf>,
    /// Seek offset into the media audio file
    pub media_audio_start_ms: u64,
    /// Send the media file straight to the target, bypassing compositing
    pub direct_passthrough: bool,
    /// Deliver through the in-process master-clock session instead of the
    /// frame pipe
    pub use_master_clock: bool,
    pub tuning: SyncTuning,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            target: String::new(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            bitrate_kbps: None,
            codec: None,
            preset: "veryfast".into(),
            capture_audio: false,
            audio_device: String::new(),
            av_sync_delay_ms: 0,
            media_audio_path: None,
            media_audio_start_ms: 0,
            direct_passthrough: false,
            use_master_clock: false,
            tuning: SyncTuning::default(),
        }
    }
}

impl StreamSettings {
    /// Fail-fast validation; called synchronously from `start()`.
    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(Error::Config("streaming target is required".into()));
        }
        if self.fps == 0 || self.fps > 240 {
            return Err(Error::Config(format!("fps out of range: {}", self.fps)));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "invalid resolution {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(Error::Config(format!(
                "resolution must be even for 4:2:0 encoding, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Raw frame size for this geometry, in bytes
    pub fn frame_bytes(&self) -> usize {
        crate::frame::VideoFrame::byte_len(self.width, self.height)
    }
}

/// Machine-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Explicit ffmpeg binary path; otherwise looked up on PATH
    pub ffmpeg_path: Option<PathBuf>,
    /// Backoff between transport reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Audio bitrate for the AAC leg
    pub audio_bitrate_kbps: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            reconnect_delay_ms: 2000,
            audio_bitrate_kbps: 192,
        }
    }
}

impl AppConfig {
    /// Load from the platform config directory, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "config parse failed: {e}");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| Error::Config("no config directory available".into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("serialize config: {e}")))?;
        std::fs::write(&path, text)?;
        Ok(())
    }

    fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "live-av", "live-av-engine")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
