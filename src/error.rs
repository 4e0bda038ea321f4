//! Error types for tonearm
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// Main error type for the tonearm engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Output device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tonearm
pub type Result<T> = std::result::Result<T, EngineError>;
