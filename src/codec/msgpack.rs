//! MsgPack codec using `rmp-serde`.
//!
//! Always encodes with `to_vec_named` so structs travel as maps keyed by
//! field name. Envelope bodies and message payloads stay self-describing,
//! and peers built from different revisions of a message shape can still
//! read the fields they know.
//!
//! # Example
//!
//! ```
//! use wirebus::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Ping {
//!     code: u32,
//! }
//!
//! let encoded = MsgPackCodec::encode(&Ping { code: 7 }).unwrap();
//! let decoded: Ping = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, Ping { code: 7 });
//! ```

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
