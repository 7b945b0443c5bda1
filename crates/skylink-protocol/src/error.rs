//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Outgoing call could not be encoded (non-string argument, oversized frame).
    #[error("encoding failed: {reason}")]
    Encoding { reason: String },

    /// Incoming frame does not have the positional-array shape.
    #[error("malformed frame: {reason}")]
    Decode { reason: String },

    /// Underlying JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates an encoding error.
    pub fn encoding(reason: impl Into<String>) -> Self {
        Self::Encoding {
            reason: reason.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Returns true for errors caused by the inbound side.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}
