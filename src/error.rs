//! Error types for the message bus.

use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack encoding error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack decoding error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Dialing the endpoint failed after every retry attempt.
    #[error("Connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The connection carrying a request went away before the reply arrived.
    #[error("Connection lost")]
    ConnectionLost,

    /// A frame could not be decoded into an envelope. Fatal for the connection.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// No local registration for a message type or slug.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// A request handler already exists for the slug on this endpoint.
    #[error("Handler already registered for {0}")]
    DuplicateHandler(String),

    /// Two different message types claimed the same slug.
    #[error("Slug {slug} is already registered for {existing}")]
    SlugCollision { slug: String, existing: String },

    /// The request deadline elapsed without a reply.
    #[error("Request timed out")]
    Timeout,

    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,

    /// The remote handler failed or refused the request.
    #[error("Remote handler error: {0}")]
    Remote(String),

    /// The reply carried a different message type than the caller expected.
    #[error("Unexpected reply type: expected {expected}, got {actual}")]
    UnexpectedReply { expected: String, actual: String },

    /// The outbound queue stayed full for longer than the backpressure timeout.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Wire-level protocol violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Whether this error leaves the connection usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BusError::UnknownType(_)
                | BusError::Timeout
                | BusError::Cancelled
                | BusError::Remote(_)
                | BusError::UnexpectedReply { .. }
                | BusError::ConnectFailed { .. }
        )
    }
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
