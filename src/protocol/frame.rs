//! Outbound frame builder.
//!
//! Fields are serialized in the layout [`ByteStream`](super::ByteStream)
//! reads. A frame is built into one contiguous buffer and handed to the
//! writer as a single `Bytes`, so concurrent requests never interleave
//! partial frames on the socket.
//!
//! # Example
//!
//! ```
//! use sockwire::protocol::{FrameBuilder, Tag};
//!
//! let frame = FrameBuilder::command(Tag::new(*b"ping"))
//!     .write_string("1")
//!     .write_string("hello")
//!     .finish();
//!
//! assert_eq!(&frame[..4], b"ping");
//! assert_eq!(frame.len(), 4 + (9 + 1) + (9 + 5));
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{markers, Tag};

/// Builder for one outbound frame.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    /// Start an untagged buffer (used for the handshake and in tests).
    pub fn raw() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    /// Start a frame with the given command tag.
    pub fn command(tag: Tag) -> Self {
        Self::raw().write_tag(tag)
    }

    /// Append raw bytes.
    pub fn write(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Append a 4-byte tag.
    pub fn write_tag(mut self, tag: Tag) -> Self {
        self.buf.put_slice(tag.as_bytes());
        self
    }

    /// Append a native-endian `Int32`.
    pub fn write_i32(mut self, value: i32) -> Self {
        self.buf.put_slice(&value.to_ne_bytes());
        self
    }

    /// Append a big-endian `Int64`.
    pub fn write_i64(mut self, value: i64) -> Self {
        self.buf.put_i64(value);
        self
    }

    /// Append a `String` field.
    ///
    /// Uses the ASCII marker for 7-bit clean text and the UTF-8 marker
    /// otherwise; the length prefix is the byte length.
    pub fn write_string(mut self, value: &str) -> Self {
        self.buf.reserve(1 + 8 + value.len());
        self.buf.put_u8(markers::for_str(value));
        self.buf.put_u64(value.len() as u64);
        self.buf.put_slice(value.as_bytes());
        self
    }

    /// Encoded size so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freeze into the wire bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
