//! Wire format constants and the command tag type.
//!
//! Every frame starts with a 4-byte ASCII command tag followed by fields:
//! ```text
//! ┌──────────┬─────────────────────────────────────────────┐
//! │ Tag      │ Fields (order fixed per command)            │
//! │ 4 bytes  │ Int32 | Int64 | String ...                  │
//! └──────────┴─────────────────────────────────────────────┘
//!
//! Int32  : 4 bytes, native byte order
//! Int64  : 8 bytes, Big Endian
//! String : marker ('A' | 'U') │ length (u64 BE) │ bytes
//! ```
//!
//! There is no self-describing schema: both ends must agree on the field
//! order of every command.

use std::fmt;

use crate::error::{Result, SockwireError};

/// Command tag size in bytes (fixed, exactly 4).
pub const TAG_SIZE: usize = 4;

/// Width of an `Int32` field.
pub const INT32_SIZE: usize = 4;

/// Width of an `Int64` field.
pub const INT64_SIZE: usize = 8;

/// Width of the length prefix of a `String` field.
pub const STRING_LENGTH_SIZE: usize = 8;

/// Marker byte plus length prefix.
pub const STRING_HEADER_SIZE: usize = 1 + STRING_LENGTH_SIZE;

/// Default maximum string field size (1 GB).
pub const DEFAULT_MAX_STRING_LENGTH: u64 = 1_073_741_824;

/// String type markers.
pub mod markers {
    /// 7-bit clean payload.
    pub const ASCII: u8 = b'A';
    /// UTF-8 encoded payload.
    pub const UTF8: u8 = b'U';

    /// Check whether a byte is a known string marker.
    #[inline]
    pub fn is_valid(marker: u8) -> bool {
        marker == ASCII || marker == UTF8
    }

    /// Pick the marker for a string: ASCII when 7-bit clean, UTF-8 otherwise.
    #[inline]
    pub fn for_str(s: &str) -> u8 {
        if s.is_ascii() {
            ASCII
        } else {
            UTF8
        }
    }
}

/// A 4-byte command tag.
///
/// Tags are compared byte-for-byte, so `ping` and `PING` are distinct
/// commands (the convention is lowercase for requests, uppercase for replies).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag([u8; TAG_SIZE]);

impl Tag {
    /// Create a tag from its raw bytes.
    ///
    /// ```
    /// use sockwire::protocol::Tag;
    ///
    /// const PONG: Tag = Tag::new(*b"PONG");
    /// assert_eq!(PONG.as_str(), "PONG");
    /// ```
    #[inline]
    pub const fn new(bytes: [u8; TAG_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw tag bytes, as written on the wire.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }

    /// Tag text. Non-UTF-8 tags (only seen on a desynced stream) render as `"????"`.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl TryFrom<&str> for Tag {
    type Error = SockwireError;

    fn try_from(value: &str) -> Result<Self> {
        let bytes: [u8; TAG_SIZE] = value.as_bytes().try_into().map_err(|_| {
            SockwireError::Protocol(format!("command tag {value:?} is not {TAG_SIZE} bytes"))
        })?;
        if !value.is_ascii() {
            return Err(SockwireError::Protocol(format!(
                "command tag {value:?} is not ASCII"
            )));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag(\"{self}\")")
    }
}

/// Encoded size of a string field.
#[inline]
pub fn encoded_string_len(s: &str) -> usize {
    STRING_HEADER_SIZE + s.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip_text() {
        let tag = Tag::try_from("run ").unwrap();
        assert_eq!(tag.as_bytes(), b"run ");
        assert_eq!(tag.as_str(), "run ");
        assert_eq!(tag, Tag::new(*b"run "));
    }

    #[test]
    fn test_tag_rejects_wrong_length() {
        assert!(Tag::try_from("abc").is_err());
        assert!(Tag::try_from("abcde").is_err());
    }

    #[test]
    fn test_tag_rejects_non_ascii() {
        // "ñab" is 4 bytes in UTF-8 but not ASCII
        assert!(Tag::try_from("ñab").is_err());
    }

    #[test]
    fn test_tag_display_escapes_binary() {
        let tag = Tag::new([b'A', 0x00, b'B', 0xff]);
        assert_eq!(tag.to_string(), "A\\x00B\\xff");
        assert_eq!(tag.as_str(), "????");
    }

    #[test]
    fn test_marker_selection() {
        assert_eq!(markers::for_str("hello"), markers::ASCII);
        assert_eq!(markers::for_str(""), markers::ASCII);
        assert_eq!(markers::for_str("说明"), markers::UTF8);
        assert!(markers::is_valid(b'A'));
        assert!(markers::is_valid(b'U'));
        assert!(!markers::is_valid(b'N'));
    }

    #[test]
    fn test_encoded_string_len_counts_bytes() {
        assert_eq!(encoded_string_len(""), 9);
        assert_eq!(encoded_string_len("abc"), 12);
        // 2 chars, 6 bytes
        assert_eq!(encoded_string_len("说明"), 15);
    }
}
