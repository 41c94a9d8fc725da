//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding lifecycle events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The topic is not one the cluster service subscribes to.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
