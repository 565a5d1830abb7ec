//! Process-supervised streaming delivery
//!
//! The fallback/production transport path: rendered frames are piped to an
//! external ffmpeg process that encodes and pushes to the ingest target.
//! This module owns encoder selection and bitrate policy, the ffmpeg
//! command builders, the supervised child process with backpressure, and
//! the controller state machine with automatic recovery.

pub mod command;
pub mod controller;
pub mod encoder;
pub mod process;

pub use controller::{ControllerState, PipelineController, StatusEvent, StreamStatus};
pub use encoder::{recommended_bitrate_kbps, EncoderKind};
pub use process::{EncoderProcess, ProcEvent, WriteOutcome, WriterHandle};
