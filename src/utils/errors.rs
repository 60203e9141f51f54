// src/utils/errors.rs
//! Engine error types

use crate::recording::event::EventId;
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the tracing engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("recorder {0} is still recording")]
    RecorderActive(String),

    #[error("event {event} references unknown parent {parent}")]
    DanglingParent { event: EventId, parent: EventId },

    #[error("invalid route pattern {pattern}: {reason}")]
    InvalidRoute { pattern: String, reason: String },

    /// The normalizer could not match a path the router already resolved.
    #[error("no match for {path} with route regex {regex}")]
    NormalizerMismatch { path: String, regex: String },

    #[error("export failed: {0}")]
    ExportFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}
