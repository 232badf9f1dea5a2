//! Protocol module - wire framing.
//!
//! Every envelope travels as a length-prefixed frame:
//! - 4-byte little-endian length header
//! - frame buffer for accumulating partial reads
//! - frame struct carrying the raw envelope body

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, build_frame_parts, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    decode_header, encode_header, validate_header, Header, ABSOLUTE_MAX_FRAME_SIZE,
    DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE,
};
