//! Envelope model and the codec that turns it into frame bodies.
//!
//! An envelope body is a MsgPack map:
//!
//! ```text
//! { id: uuid(16), typeSlug: str, payloadKind: str, correlationId: uuid(16), data: bin }
//! ```
//!
//! `correlationId` is the nil UUID on everything except replies. When a
//! shared secret is configured the whole body is sealed with
//! [`PayloadCipher`] before framing.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MsgPackCodec, PayloadCipher, PayloadFormat};
use crate::error::{BusError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::writer::OutboundFrame;

/// What an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Fire-and-forget message for every subscriber of its type.
    Broadcast,
    /// Request expecting exactly one reply.
    Request,
    /// Reply to a request, correlated by the request id.
    Reply,
    /// Bus-internal routing traffic, never delivered to application code.
    Control,
}

/// A single message on the wire.
///
/// Immutable once built; use the constructors to create one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    id: Uuid,
    type_slug: String,
    payload_kind: PayloadKind,
    correlation_id: Uuid,
    data: Bytes,
}

impl Envelope {
    fn new(kind: PayloadKind, slug: impl Into<String>, correlation_id: Uuid, data: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            type_slug: slug.into(),
            payload_kind: kind,
            correlation_id,
            data,
        }
    }

    /// A broadcast envelope.
    pub fn broadcast(slug: impl Into<String>, data: Bytes) -> Self {
        Self::new(PayloadKind::Broadcast, slug, Uuid::nil(), data)
    }

    /// A request envelope. Its id is the correlation key for the reply.
    pub fn request(slug: impl Into<String>, data: Bytes) -> Self {
        Self::new(PayloadKind::Request, slug, Uuid::nil(), data)
    }

    /// A reply to `request_id`, carrying an id of its own.
    pub fn reply(request_id: Uuid, slug: impl Into<String>, data: Bytes) -> Self {
        Self::new(PayloadKind::Reply, slug, request_id, data)
    }

    /// A control envelope.
    pub fn control(slug: impl Into<String>, data: Bytes) -> Self {
        Self::new(PayloadKind::Control, slug, Uuid::nil(), data)
    }

    /// Unique envelope id.
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Type slug of the payload.
    #[inline]
    pub fn slug(&self) -> &str {
        &self.type_slug
    }

    /// Payload kind.
    #[inline]
    pub fn kind(&self) -> PayloadKind {
        self.payload_kind
    }

    /// Request id this envelope answers (nil unless a reply).
    #[inline]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Serialized message bytes.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    fn validate(&self) -> Result<()> {
        if self.type_slug.is_empty() {
            return Err(BusError::MalformedEnvelope("empty type slug".to_string()));
        }
        match (self.payload_kind, self.correlation_id.is_nil()) {
            (PayloadKind::Reply, true) => Err(BusError::MalformedEnvelope(
                "reply without correlation id".to_string(),
            )),
            (PayloadKind::Reply, false) | (_, true) => Ok(()),
            (kind, false) => Err(BusError::MalformedEnvelope(format!(
                "{:?} envelope carries a correlation id",
                kind
            ))),
        }
    }
}

/// An envelope together with its encoded (and possibly encrypted) body.
///
/// The body is computed once, so fan-out to many connections only clones
/// a reference-counted buffer.
#[derive(Debug, Clone)]
pub struct SealedEnvelope {
    envelope: Envelope,
    frame: OutboundFrame,
}

impl SealedEnvelope {
    /// The decoded envelope.
    #[inline]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The frame body as written on the wire.
    #[inline]
    pub fn wire(&self) -> &Bytes {
        &self.frame.payload
    }

    /// Build an outbound frame sharing this body.
    pub fn to_frame(&self) -> OutboundFrame {
        self.frame.clone()
    }

    /// Consume and return the envelope.
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

/// Encodes envelopes into frame bodies and decodes them back.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    format: PayloadFormat,
    cipher: Option<PayloadCipher>,
    max_frame_size: u32,
}

impl EnvelopeCodec {
    /// Plain codec for the given payload format.
    pub fn new(format: PayloadFormat) -> Self {
        Self {
            format,
            cipher: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Seal every body with a key derived from `secret`.
    pub fn with_secret(mut self, secret: &[u8]) -> Self {
        self.cipher = Some(PayloadCipher::from_secret(secret));
        self
    }

    /// Refuse to produce bodies larger than `max_frame_size`.
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Payload format used for message data.
    #[inline]
    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// Maximum body size accepted in either direction.
    #[inline]
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Serialize `message` into a fresh envelope of the given kind and seal it.
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        kind: PayloadKind,
        slug: &str,
        message: &T,
    ) -> Result<SealedEnvelope> {
        let data = self.format.encode(message)?;
        let envelope = match kind {
            PayloadKind::Broadcast => Envelope::broadcast(slug, data),
            PayloadKind::Request => Envelope::request(slug, data),
            PayloadKind::Control => Envelope::control(slug, data),
            PayloadKind::Reply => {
                return Err(BusError::Protocol(
                    "replies must be built with Envelope::reply".to_string(),
                ))
            }
        };
        self.seal(envelope)
    }

    /// Encode an envelope into its frame body.
    pub fn seal(&self, envelope: Envelope) -> Result<SealedEnvelope> {
        let body = MsgPackCodec::encode(&envelope)?;
        let body = match &self.cipher {
            Some(cipher) => cipher.encrypt(&body)?,
            None => body,
        };

        if body.len() > self.max_frame_size as usize {
            return Err(BusError::Protocol(format!(
                "Envelope of {} bytes exceeds maximum frame size {}",
                body.len(),
                self.max_frame_size
            )));
        }

        Ok(SealedEnvelope {
            envelope,
            frame: OutboundFrame::new(Bytes::from(body))?,
        })
    }

    /// Decode a frame body.
    ///
    /// Any failure (bad ciphertext, truncated or non-conforming body) is a
    /// [`BusError::MalformedEnvelope`].
    pub fn open(&self, wire: Bytes) -> Result<SealedEnvelope> {
        let envelope: Envelope = match &self.cipher {
            Some(cipher) => {
                let plain = cipher.decrypt(&wire)?;
                rmp_serde::from_slice(&plain)
            }
            None => rmp_serde::from_slice(&wire),
        }
        .map_err(|e| BusError::MalformedEnvelope(e.to_string()))?;

        envelope.validate()?;
        Ok(SealedEnvelope {
            envelope,
            frame: OutboundFrame::new(wire)?,
        })
    }

    /// Deserialize the message carried by an envelope.
    pub fn decode_data<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T> {
        self.format.decode(envelope.data())
    }
}
