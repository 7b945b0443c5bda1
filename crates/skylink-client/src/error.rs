//! Client error types.

use thiserror::Error;

use skylink_protocol::ProtocolError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced to callers of the client.
///
/// Apart from `ConnectionLost` and `Closed`, an error belongs to a single
/// call or to the subscribers sharing one server-side stream.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Arguments could not be encoded. A caller bug; never retried.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// An inbound frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The server answered with an `et`/`msg` error envelope.
    #[error("server error {error_type}: {message}")]
    Server { error_type: String, message: String },

    /// No response arrived before the deadline.
    #[error("timeout waiting for {operation}")]
    Timeout { operation: String },

    /// The socket dropped while the call was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The client was closed by its owner.
    #[error("client closed")]
    Closed,

    /// Transport-level failure (handshake, socket I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Creates a server error from an `et`/`msg` pair.
    pub fn server(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Copy for handing the same failure to several subscribers. I/O errors
    /// keep their kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Encoding(m) => Self::Encoding(m.clone()),
            Self::Decode(m) => Self::Decode(m.clone()),
            Self::Server {
                error_type,
                message,
            } => Self::server(error_type.clone(), message.clone()),
            Self::Timeout { operation } => Self::timeout(operation.clone()),
            Self::ConnectionLost => Self::ConnectionLost,
            Self::Closed => Self::Closed,
            Self::Transport(m) => Self::Transport(m.clone()),
            Self::Config(m) => Self::Config(m.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionLost | Self::Transport(_)
        )
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Decode { reason } => Self::Decode(reason),
            ProtocolError::Encoding { reason } => Self::Encoding(reason),
            ProtocolError::Json(e) => Self::Encoding(e.to_string()),
        }
    }
}
