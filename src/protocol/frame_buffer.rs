//! Reassembly of length-prefixed frames from arbitrary read chunks.
//!
//! Stream reads split and merge frames freely. [`FrameBuffer`] keeps the
//! unconsumed tail in one `BytesMut` and walks a two-step cycle per frame:
//! read the 4-byte prefix, then wait until that many body bytes are
//! buffered. Bodies are split off without copying.
//!
//! # Example
//!
//! ```
//! use wirebus::protocol::{build_frame, FrameBuffer};
//!
//! let mut frames = FrameBuffer::new();
//! let wire = build_frame(b"hello");
//!
//! assert!(frames.push(&wire[..3]).unwrap().is_empty());
//! let complete = frames.push(&wire[3..]).unwrap();
//! assert_eq!(complete[0].payload(), b"hello");
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// Initial capacity of the reassembly buffer.
const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Fewer than [`HEADER_SIZE`] bytes of the next prefix are buffered.
    Prefix,
    /// Prefix consumed; `len` body bytes still belong to this frame.
    Body { len: usize },
}

/// Accumulates stream bytes and yields whole frames.
pub struct FrameBuffer {
    pending: BytesMut,
    stage: Stage,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Buffer with the default body limit (16 MiB).
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Buffer that rejects bodies larger than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            pending: BytesMut::with_capacity(INITIAL_CAPACITY),
            stage: Stage::Prefix,
            max_frame_size,
        }
    }

    /// Append `chunk` and return every frame it completes, in order.
    ///
    /// # Errors
    ///
    /// A prefix declaring more than the body limit is an error. Frame
    /// boundaries are lost at that point, so the stream must be dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.pending.extend_from_slice(chunk);

        let mut complete = Vec::new();
        while let Some(frame) = self.next_frame()? {
            complete.push(frame);
        }
        Ok(complete)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.stage == Stage::Prefix {
            let Some(header) = Header::decode(&self.pending) else {
                return Ok(None);
            };
            header.validate(self.max_frame_size)?;
            self.pending.advance(HEADER_SIZE);
            self.stage = Stage::Body {
                len: header.payload_length as usize,
            };
        }

        let Stage::Body { len } = self.stage else {
            return Ok(None);
        };
        if self.pending.len() < len {
            return Ok(None);
        }

        let body = if len == 0 {
            Bytes::new()
        } else {
            self.pending.split_to(len).freeze()
        };
        self.stage = Stage::Prefix;
        Ok(Some(Frame::new(body)))
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether part of a frame has arrived but not all of it.
    pub fn is_mid_frame(&self) -> bool {
        !self.pending.is_empty() || matches!(self.stage, Stage::Body { .. })
    }

    /// Drop buffered bytes and start over at a frame boundary.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.stage = Stage::Prefix;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
