//! # Live AV Engine
//!
//! Real-time audio/video synchronization and streaming-transport engine
//! for live production: converts irregularly-arriving captured frames into
//! a steady output cadence, keeps independently-scheduled video and audio
//! pipelines on one wall-clock timeline, corrects drift between them with
//! sample-accurate audio adjustments, and supervises an external encoding
//! process with backpressure handling and automatic recovery.
//!
//! ## Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!                       │        Master Clock          │
//!                       │   (monotonic, shared origin) │
//!                       └──────┬───────────────┬───────┘
//!                              │               │
//!  capture sources             ▼               ▼
//!  ┌──────────┐   ┌────────────────────┐   ┌─────────────────────────────┐
//!  │  cam 1   │──▶│  Frame-Rate        │   │  Master-Clock Session       │
//!  ├──────────┤   │  Converter/Registry│   │  ┌───────────┐ ┌──────────┐ │
//!  │  cam 2   │──▶│  (grid emission,   │   │  │video loop │ │audio loop│ │
//!  ├──────────┤   │   heartbeat dups)  │   │  │ pts=count │ │ drift-   │ │
//!  │  media   │──▶│                    │   │  │  /fps     │ │ correct  │ │
//!  └──────────┘   └────────┬───────────┘   │  └─────┬─────┘ └────┬─────┘ │
//!                          │               │        ▼            ▼       │
//!                          │               │   ┌────────────────────┐    │
//!            ┌─────────────┘               │   │ mux (output lock)  │    │
//!            ▼                             │   └─────────┬──────────┘    │
//!  ┌────────────────────┐                  └─────────────┼───────────────┘
//!  │ Pipeline Controller│                                │
//!  │ (frame tick, back- │     raw RGBA                   ▼
//!  │  pressure, restart)│───▶ ffmpeg process ───▶ RTMP ingest / file
//!  └────────────────────┘
//! ```
//!
//! The controller and registry are explicit service objects constructed at
//! application start; a single shared [`sched::TimerService`] drives the
//! registry heartbeat and the controller's frame delivery tick.

pub mod audio;
pub mod clock;
pub mod codec;
pub mod config;
pub mod egress;
pub mod error;
pub mod frame;
pub mod mux;
pub mod rate;
pub mod sched;
pub mod session;

pub use clock::MasterClock;
pub use config::{AppConfig, StreamSettings, SyncTuning};
pub use egress::{PipelineController, StatusEvent, StreamStatus};
pub use error::{Error, Result};
pub use frame::{FrameProvider, TimestampedFrame, VideoFrame};
pub use rate::FrameRateRegistry;
pub use sched::TimerService;
pub use session::MasterClockSession;

/// Engine-wide constants
pub mod constants {
    /// Sample rate of the audio processing domain
    pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

    /// Channel count of the audio processing domain (stereo)
    pub const AUDIO_CHANNELS: u16 = 2;

    /// Samples per channel in a synthesized audio block (~21 ms)
    pub const SAMPLES_PER_BLOCK: usize = 1024;

    /// Default output frame rate
    pub const DEFAULT_FPS: u32 = 60;

    /// Default output geometry
    pub const DEFAULT_WIDTH: u32 = 1920;
    pub const DEFAULT_HEIGHT: u32 = 1080;

    /// Frames' worth of queued bytes tolerated before delivery sheds frames
    pub const BACKPRESSURE_FRAMES: usize = 2;
}
