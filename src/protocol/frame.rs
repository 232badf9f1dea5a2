//! Frame struct: one length-delimited envelope body.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use wirebus::protocol::{build_frame, Frame, Header};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(Bytes::from_static(b"hello"));
//! assert_eq!(frame.header(), Header::new(5));
//! assert_eq!(build_frame(frame.payload()), b"\x05\x00\x00\x00hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// A complete frame read off the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Envelope body bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from body bytes.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the body as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Get the body length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Header matching this frame's body.
    #[inline]
    pub fn header(&self) -> Header {
        Header::new(self.payload.len() as u32)
    }
}

/// Build a complete frame as a single byte vector.
///
/// Use `build_frame_parts` for scatter/gather I/O (writev).
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&Header::new(payload.len() as u32).encode());
    buf.extend_from_slice(payload);
    buf
}

/// Build frame parts for scatter/gather I/O.
pub fn build_frame_parts(payload: &[u8]) -> ([u8; HEADER_SIZE], &[u8]) {
    (Header::new(payload.len() as u32).encode(), payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(Bytes::from_static(b"hello"));
        assert_eq!(frame.payload(), b"hello");
        assert_eq!(frame.payload_len(), 5);
        assert_eq!(frame.header().payload_length, 5);
    }

    #[test]
    fn test_build_frame_prefixes_length() {
        let bytes = build_frame(b"abc");
        assert_eq!(&bytes[..HEADER_SIZE], &[3, 0, 0, 0]);
        assert_eq!(&bytes[HEADER_SIZE..], b"abc");
    }

    #[test]
    fn test_build_frame_parts_matches_build_frame() {
        let (header, body) = build_frame_parts(b"xyz");
        let mut joined = header.to_vec();
        joined.extend_from_slice(body);
        assert_eq!(joined, build_frame(b"xyz"));
    }

    #[test]
    fn test_empty_frame() {
        assert_eq!(build_frame(b""), vec![0, 0, 0, 0]);
    }
}
