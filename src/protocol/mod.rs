//! Protocol module - wire format, byte stream and frame building.
//!
//! This module implements the binary protocol shared with the worker:
//! - 4-byte command tags and typed fields
//! - Byte stream with transactional reads for partial input
//! - Frame builder for outbound commands

mod byte_stream;
mod frame;
mod wire_format;

pub use byte_stream::ByteStream;
pub use frame::FrameBuilder;
pub use wire_format::{
    encoded_string_len, markers, Tag, DEFAULT_MAX_STRING_LENGTH, INT32_SIZE, INT64_SIZE,
    STRING_HEADER_SIZE, STRING_LENGTH_SIZE, TAG_SIZE,
};
