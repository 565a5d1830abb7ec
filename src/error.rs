//! Error types for the streaming engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
///
/// `DeviceUnavailable` is non-fatal everywhere it can occur: callers fall
/// back to synthesized silence instead of failing the session.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio input ended")]
    EndOfStream,

    #[error("Timeout waiting for audio")]
    Timeout,
}

/// Encoder errors
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Encoder initialization failed: {0}")]
    InitFailed(String),

    #[error("Encoder rejected at runtime: {0}")]
    Rejected(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Encoder probe failed: {0}")]
    ProbeFailed(String),

    #[error("No working encoder found")]
    NoEncoder,
}

/// Transport and process-supervision errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Encoder process exited unexpectedly (code {0:?})")]
    ProcessExited(Option<i32>),

    #[error("Broken pipe: {0}")]
    BrokenPipe(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Mux failed: {0}")]
    MuxFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
