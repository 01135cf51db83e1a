//! Error types for live voice sessions

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture and output device errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device access denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Capture source already used")]
    AlreadyStarted,

    #[error("Capture stream ended")]
    StreamEnded,
}

/// Uplink/downlink codec errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("Unsupported mime type: {0}")]
    UnsupportedMime(String),

    #[error("Truncated PCM payload: {0} bytes")]
    TruncatedPayload(usize),

    #[error("Empty audio payload")]
    EmptyPayload,
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Timeout")]
    Timeout,
}

/// Controller usage errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("No previous session to retry")]
    NothingToRetry,

    #[error("Connect cancelled by disconnect")]
    Cancelled,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
