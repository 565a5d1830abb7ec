//! A/V master-clock streaming session
//!
//! Runs independent video and audio loops against one monotonic timeline
//! and muxes both into a single container under one output lock. The video
//! counter is the canonical timeline (PTS in 1/fps units); audio tracks a
//! 48 kHz sample position and is drift-corrected toward the clock. A
//! program source switch purges not-yet-emitted audio and re-arms a short
//! delay without ever touching the video timeline.

pub mod audio;
pub mod video;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::audio::{AudioSource, DeviceSource, MediaFileSource, SilenceSource};
use crate::clock::MasterClock;
use crate::codec::{AudioEncoder, PipeAacEncoder, PipeH264Encoder, VideoEncoder};
use crate::config::{AppConfig, StreamSettings, SyncTuning};
use crate::egress::encoder::recommended_bitrate_kbps;
use crate::error::{Error, Result};
use crate::frame::FrameProvider;
use crate::mux::{open_muxer, Muxer};

pub use audio::{audio_lead_secs, plan_correction, Correction, DelayBuffer};

/// How long `stop()` waits for each loop to exit
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the two loops and the control surface
pub(crate) struct SessionShared {
    pub clock: MasterClock,
    pub running: AtomicBool,
    /// Canonical video timeline: frames actually emitted
    pub video_frames: AtomicU64,
    /// Audio sample position in the 48 kHz domain
    pub audio_emitted: AtomicU64,
    /// The single-writer output resource
    pub mux: Mutex<Box<dyn Muxer>>,
}

/// Geometry and timing for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub tuning: SyncTuning,
}

impl SessionConfig {
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            width: settings.width,
            height: settings.height,
            fps: settings.fps,
            tuning: settings.tuning.clone(),
        }
    }
}

/// The pluggable halves of a session; production parts come from
/// [`SessionParts::open`], tests inject fakes.
pub struct SessionParts {
    pub muxer: Box<dyn Muxer>,
    pub video_encoder: Box<dyn VideoEncoder>,
    pub audio_encoder: Box<dyn AudioEncoder>,
    pub audio_source: Box<dyn AudioSource>,
}

impl SessionParts {
    /// Build the production stack for `settings`: FLV muxer over the
    /// target, pipe encoders, and the best available audio source with a
    /// silence fallback.
    pub fn open(settings: &StreamSettings, app: &AppConfig, ffmpeg: &Path) -> Result<Self> {
        let bitrate = settings
            .bitrate_kbps
            .unwrap_or_else(|| recommended_bitrate_kbps(settings.width, settings.height, settings.fps));

        let muxer = open_muxer(&settings.target, Some(ffmpeg))?;
        let video_encoder: Box<dyn VideoEncoder> = Box::new(PipeH264Encoder::spawn(
            ffmpeg,
            settings.width,
            settings.height,
            settings.fps,
            bitrate,
            &settings.preset,
        )?);
        let audio_encoder: Box<dyn AudioEncoder> =
            Box::new(PipeAacEncoder::spawn(ffmpeg, app.audio_bitrate_kbps)?);
        let audio_source = open_audio_source(settings, ffmpeg);

        Ok(Self {
            muxer,
            video_encoder,
            audio_encoder,
            audio_source,
        })
    }
}

/// Open the configured audio input, falling back to silence on any failure
fn open_audio_source(settings: &StreamSettings, ffmpeg: &Path) -> Box<dyn AudioSource> {
    if let Some(path) = &settings.media_audio_path {
        match MediaFileSource::open(ffmpeg, path, settings.media_audio_start_ms) {
            Ok(source) => return Box::new(source),
            Err(e) => tracing::warn!("media audio unavailable ({e}), using silence"),
        }
    } else if settings.capture_audio {
        match DeviceSource::open(&settings.audio_device) {
            Ok(source) => return Box::new(source),
            Err(e) => tracing::warn!("audio device unavailable ({e}), using silence"),
        }
    } else {
        tracing::info!("no audio input configured, generating silence");
    }
    Box::new(SilenceSource::new())
}

/// A running master-clock session
pub struct MasterClockSession {
    shared: Arc<SessionShared>,
    delay: Arc<Mutex<DelayBuffer>>,
    tuning: SyncTuning,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MasterClockSession {
    /// Anchor the clock and launch both loops with the given parts
    pub fn start(config: SessionConfig, provider: FrameProvider, parts: SessionParts) -> Result<Self> {
        if config.fps == 0 {
            return Err(Error::Config("session fps must be positive".into()));
        }

        let shared = Arc::new(SessionShared {
            clock: MasterClock::new(),
            running: AtomicBool::new(true),
            video_frames: AtomicU64::new(0),
            audio_emitted: AtomicU64::new(0),
            mux: Mutex::new(parts.muxer),
        });
        shared.clock.reset();
        let delay = Arc::new(Mutex::new(DelayBuffer::new()));

        let video_shared = shared.clone();
        let (width, height, fps) = (config.width, config.height, config.fps);
        let video_thread = std::thread::Builder::new()
            .name("av-video".into())
            .spawn(move || {
                video::run_video_loop(
                    video_shared,
                    provider,
                    parts.video_encoder,
                    width,
                    height,
                    fps,
                );
            })
            .map_err(|e| Error::Config(format!("spawn video loop: {e}")))?;

        let audio_shared = shared.clone();
        let audio_delay = delay.clone();
        let tuning = config.tuning.clone();
        let audio_tuning = tuning.clone();
        let audio_thread = std::thread::Builder::new()
            .name("av-audio".into())
            .spawn(move || {
                audio::run_audio_loop(
                    audio_shared,
                    audio_delay,
                    parts.audio_source,
                    parts.audio_encoder,
                    audio_tuning,
                    fps,
                );
            })
            .map_err(|e| Error::Config(format!("spawn audio loop: {e}")))?;

        tracing::info!(width, height, fps, "master-clock session started");
        Ok(Self {
            shared,
            delay,
            tuning,
            threads: Mutex::new(vec![video_thread, audio_thread]),
        })
    }

    /// Start with the production parts for `settings`
    pub fn open(
        settings: &StreamSettings,
        app: &AppConfig,
        ffmpeg: &Path,
        provider: FrameProvider,
    ) -> Result<Self> {
        settings.validate()?;
        let parts = SessionParts::open(settings, app, ffmpeg)?;
        Self::start(SessionConfig::from_settings(settings), provider, parts)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Program source switched: purge buffered audio from the old source
    /// and hold new audio until `delay_ms` worth of samples accumulates.
    /// The video timeline continues uninterrupted.
    pub fn on_source_switch(&self, delay_ms: u64) {
        let samples = crate::config::ms_to_samples(delay_ms);
        let mut delay = self.delay.lock();
        delay.purge();
        delay.request_delay(samples);
        tracing::info!(
            delay_ms,
            pending = delay.pending_delay_samples(),
            "source switch: audio buffer purged, delay armed"
        );
    }

    /// Source switch using the configured default delay
    pub fn on_source_switch_default(&self) {
        self.on_source_switch(self.tuning.switch_delay_ms);
    }

    /// Frames on the canonical video timeline
    pub fn video_frames(&self) -> u64 {
        self.shared.video_frames.load(Ordering::Acquire)
    }

    /// Audio position in 48 kHz samples
    pub fn audio_samples_emitted(&self) -> u64 {
        self.shared.audio_emitted.load(Ordering::Acquire)
    }

    /// Current audio-ahead-of-video drift in seconds
    pub fn drift_secs(&self, fps: u32) -> f64 {
        audio_lead_secs(self.audio_samples_emitted(), self.video_frames(), fps)
    }

    /// Stop both loops, flush and close the output. Idempotent; safe from
    /// any thread. Loops are joined with a bounded timeout before the
    /// container is finalized.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            join_with_timeout(handle, JOIN_TIMEOUT);
        }

        if let Err(e) = self.shared.mux.lock().finalize() {
            tracing::warn!("container finalize failed: {e}");
        }
        tracing::info!(
            video_frames = self.video_frames(),
            audio_samples = self.audio_samples_emitted(),
            "master-clock session stopped"
        );
    }
}

impl Drop for MasterClockSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join a loop thread, giving up after `timeout`
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(
                thread = handle.thread().name().unwrap_or("?"),
                "loop did not exit within timeout, detaching"
            );
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let _ = handle.join();
}
