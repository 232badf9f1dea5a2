//! Error replies.
//!
//! When a request cannot be answered the responder still sends a reply, so
//! the caller never waits for its full timeout. The reply carries the
//! reserved slug `$error` and an [`ErrorReply`] body.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{Envelope, MsgPackCodec};
use crate::error::{BusError, Result};

/// Reply slug marking an error reply.
pub const ERROR_SLUG: &str = "$error";

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No handler for the request slug.
    UnknownType,
    /// The connection to the handling peer dropped.
    ConnectionLost,
    /// The handler returned an error or panicked.
    HandlerFailed,
    /// Too many handlers already running.
    Overloaded,
}

/// Body of an `$error` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(bytes)
    }

    /// Reply envelope answering `request_id` with this error.
    pub fn into_envelope(self, request_id: Uuid) -> Result<Envelope> {
        Ok(Envelope::reply(request_id, ERROR_SLUG, Bytes::from(self.encode()?)))
    }

    /// Error the requester surfaces for this reply.
    pub fn into_error(self) -> BusError {
        match self.code {
            ErrorCode::UnknownType => BusError::UnknownType(self.message),
            ErrorCode::ConnectionLost => BusError::ConnectionLost,
            ErrorCode::HandlerFailed | ErrorCode::Overloaded => BusError::Remote(self.message),
        }
    }
}
