//! Codec module - envelope and payload serialization.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (struct-as-map)
//! - [`JsonCodec`] - JSON using `serde_json`
//! - [`PayloadFormat`] - runtime choice of message payload format
//! - [`PayloadCipher`] - optional AES-256-GCM sealing of envelope bodies
//! - [`EnvelopeCodec`] - turns envelopes into frame bodies and back
//!
//! # Design
//!
//! Payload codecs are marker structs with static methods rather than trait
//! objects. The bus picks one through [`PayloadFormat`], which keeps the bus
//! itself format-agnostic without generic parameters leaking into its API.
//!
//! # Example
//!
//! ```
//! use wirebus::codec::PayloadFormat;
//!
//! let bytes = PayloadFormat::Json.encode(&vec![1, 2, 3]).unwrap();
//! assert_eq!(&bytes[..], b"[1,2,3]");
//! let back: Vec<i32> = PayloadFormat::Json.decode(&bytes).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

mod cipher;
mod envelope;
mod json;
mod msgpack;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use cipher::{PayloadCipher, NONCE_SIZE};
pub use envelope::{Envelope, EnvelopeCodec, PayloadKind, SealedEnvelope};
pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::error::Result;

/// Serialization format for message payloads.
///
/// Both ends of a bus must agree on the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// MessagePack, struct-as-map.
    #[default]
    MsgPack,
    /// JSON.
    Json,
}

impl PayloadFormat {
    /// Serialize a message.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        let bytes = match self {
            PayloadFormat::MsgPack => MsgPackCodec::encode(value)?,
            PayloadFormat::Json => JsonCodec::encode(value)?,
        };
        Ok(Bytes::from(bytes))
    }

    /// Deserialize a message.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            PayloadFormat::MsgPack => MsgPackCodec::decode(bytes),
            PayloadFormat::Json => JsonCodec::decode(bytes),
        }
    }
}
