//! Wire format encoding and decoding.
//!
//! Each frame starts with a 4-byte length header:
//! ```text
//! ┌──────────────┬──────────────────────────┐
//! │ Length       │ Envelope body            │
//! │ 4 bytes      │ `Length` bytes           │
//! │ uint32 LE    │                          │
//! └──────────────┴──────────────────────────┘
//! ```
//!
//! The length is Little Endian and counts only the body bytes, so frame
//! boundaries never depend on parsing the body.

use crate::error::{BusError, Result};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Default maximum body size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Absolute maximum body size (~2 GB, max i32).
pub const ABSOLUTE_MAX_FRAME_SIZE: u32 = 2_147_483_647;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Body length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(payload_length: u32) -> Self {
        Self { payload_length }
    }

    /// Header for a body of `len` bytes.
    ///
    /// Fails if the body does not fit the 32-bit length field.
    pub fn for_body(len: usize) -> Result<Self> {
        let payload_length = u32::try_from(len).map_err(|_| {
            BusError::Protocol(format!("Frame body of {} bytes exceeds u32 length", len))
        })?;
        Ok(Self { payload_length })
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use wirebus::protocol::Header;
    ///
    /// let bytes = Header::new(5).encode();
    /// assert_eq!(bytes, [5, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        self.payload_length.to_le_bytes()
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Self {
            payload_length: u32::from_le_bytes(bytes),
        })
    }

    /// Validate the declared length against a maximum.
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.payload_length > max_frame_size {
            return Err(BusError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                self.payload_length, max_frame_size
            )));
        }
        Ok(())
    }
}

/// Encode a header to bytes (standalone function).
#[inline]
pub fn encode_header(header: &Header) -> [u8; HEADER_SIZE] {
    header.encode()
}

/// Decode a header from bytes (standalone function).
#[inline]
pub fn decode_header(buf: &[u8]) -> Option<Header> {
    Header::decode(buf)
}

/// Validate a header (standalone function).
#[inline]
pub fn validate_header(header: &Header, max_frame_size: u32) -> Result<()> {
    header.validate(max_frame_size)
}
