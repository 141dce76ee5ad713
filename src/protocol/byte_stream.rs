//! Byte stream for accumulating partial reads with transactional parsing.
//!
//! Uses `bytes::BytesMut` as the backing store. Reads never fail on short
//! input: they return `None`, leave the cursor untouched and set the
//! insufficient-data flag, so the caller can roll back and wait for the
//! next `append`.
//!
//! # Example
//!
//! ```
//! use sockwire::protocol::{ByteStream, FrameBuilder};
//!
//! let frame = FrameBuilder::raw().write_string("guid").write_i32(42).finish();
//!
//! let mut stream = ByteStream::new();
//! stream.append(&frame[..5]);
//!
//! stream.begin_transaction();
//! assert_eq!(stream.read_string().unwrap(), None);
//! stream.rollback_transaction();
//!
//! stream.append(&frame[5..]);
//! stream.begin_transaction();
//! assert_eq!(stream.read_string().unwrap().as_deref(), Some("guid"));
//! assert_eq!(stream.read_i32(), Some(42));
//! stream.end_transaction();
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{
    markers, Tag, DEFAULT_MAX_STRING_LENGTH, INT32_SIZE, INT64_SIZE, STRING_LENGTH_SIZE, TAG_SIZE,
};
use crate::error::{Result, SockwireError};

/// Consumed prefix size above which `append` compacts the buffer.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Append-only byte buffer with a read cursor and nested transaction marks.
pub struct ByteStream {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Read position inside `buffer`.
    cursor: usize,
    /// Saved cursor positions, innermost last.
    transactions: Vec<usize>,
    /// Set when the most recent read ran out of bytes.
    insufficient: bool,
    /// Maximum accepted string field length.
    max_string_length: u64,
}

impl ByteStream {
    /// Create a new stream with default settings.
    ///
    /// Default capacity: 64KB, max string length: 1GB.
    pub fn new() -> Self {
        Self::with_max_string_length(DEFAULT_MAX_STRING_LENGTH)
    }

    /// Create a new stream with a custom string length limit.
    pub fn with_max_string_length(max_string_length: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            cursor: 0,
            transactions: Vec::new(),
            insufficient: false,
            max_string_length,
        }
    }

    /// Append newly arrived bytes.
    ///
    /// Compacts the consumed prefix first when it has grown large and no
    /// transaction is open.
    pub fn append(&mut self, data: &[u8]) {
        if self.cursor >= COMPACT_THRESHOLD {
            self.compact();
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of unread bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Check whether every buffered byte has been consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current cursor offset inside the buffer.
    #[inline]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Whether the most recent read returned `None` for lack of bytes.
    #[inline]
    pub fn has_insufficient_data(&self) -> bool {
        self.insufficient
    }

    /// Number of open transactions.
    #[inline]
    pub fn transaction_depth(&self) -> usize {
        self.transactions.len()
    }

    /// Open a transaction at the current cursor.
    pub fn begin_transaction(&mut self) {
        self.transactions.push(self.cursor);
    }

    /// Commit the innermost transaction.
    ///
    /// Consumed bytes stay consumed; if an outer transaction is open they
    /// still belong to it and roll back with it.
    pub fn end_transaction(&mut self) {
        self.transactions.pop();
    }

    /// Restore the cursor to where the innermost transaction began.
    pub fn rollback_transaction(&mut self) {
        if let Some(start) = self.transactions.pop() {
            self.cursor = start;
        }
    }

    /// Drop the consumed prefix.
    ///
    /// Does nothing while a transaction is open, since saved positions are
    /// absolute buffer offsets. Returns whether the buffer was compacted.
    pub fn compact(&mut self) -> bool {
        if !self.transactions.is_empty() || self.cursor == 0 {
            return false;
        }
        self.buffer.advance(self.cursor);
        self.cursor = 0;
        true
    }

    /// Discard all buffered data and open transactions.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.transactions.clear();
        self.insufficient = false;
    }

    /// Consume `n` bytes, or flag insufficient data.
    fn take(&mut self, n: usize) -> Option<&[u8]> {
        if self.remaining() < n {
            self.insufficient = true;
            return None;
        }
        self.insufficient = false;
        let start = self.cursor;
        self.cursor += n;
        Some(&self.buffer[start..self.cursor])
    }

    fn take_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)
            .map(|bytes| bytes.try_into().unwrap_or([0u8; N]))
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Option<u8> {
        self.take_array::<1>().map(|[b]| b)
    }

    /// Read a native-endian `Int32` field.
    pub fn read_i32(&mut self) -> Option<i32> {
        self.take_array::<INT32_SIZE>().map(i32::from_ne_bytes)
    }

    /// Read a big-endian `Int64` field.
    pub fn read_i64(&mut self) -> Option<i64> {
        self.take_array::<INT64_SIZE>().map(i64::from_be_bytes)
    }

    /// Read a 4-byte command tag.
    pub fn read_tag(&mut self) -> Option<Tag> {
        self.take_array::<TAG_SIZE>().map(Tag::new)
    }

    /// Read `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Option<Bytes> {
        self.take(n).map(Bytes::copy_from_slice)
    }

    /// Read a `String` field: marker, 8-byte big-endian length, payload.
    ///
    /// Atomic: on `Ok(None)` or `Err` the cursor is left where it was.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an unknown marker, a length above the
    /// configured limit, or a payload that is not valid UTF-8.
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let start = self.cursor;
        let result = self.read_string_fields();
        if !matches!(result, Ok(Some(_))) {
            self.cursor = start;
        }
        result
    }

    fn read_string_fields(&mut self) -> Result<Option<String>> {
        let Some(marker) = self.read_byte() else {
            return Ok(None);
        };
        if !markers::is_valid(marker) {
            return Err(SockwireError::Protocol(format!(
                "invalid string marker 0x{marker:02x}"
            )));
        }

        let Some(length) = self.take_array::<STRING_LENGTH_SIZE>().map(u64::from_be_bytes) else {
            return Ok(None);
        };
        if length > self.max_string_length {
            return Err(SockwireError::Protocol(format!(
                "String length {} exceeds maximum {}",
                length, self.max_string_length
            )));
        }
        let length = usize::try_from(length).map_err(|_| {
            SockwireError::Protocol(format!("String length {length} does not fit in memory"))
        })?;

        let Some(payload) = self.take(length) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(payload)
            .map_err(|e| SockwireError::Protocol(format!("string field is not UTF-8: {e}")))?;
        Ok(Some(text.to_owned()))
    }

    /// Run `read` inside its own transaction: commit when it yields a
    /// value, roll back otherwise.
    pub fn in_transaction<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        self.begin_transaction();
        let result = read(self);
        match result {
            Ok(Some(_)) => self.end_transaction(),
            _ => self.rollback_transaction(),
        }
        result
    }

    /// [`read_byte`](Self::read_byte) wrapped in a transaction.
    pub fn read_byte_in_transaction(&mut self) -> Option<u8> {
        self.in_transaction(|s| Ok(s.read_byte())).ok().flatten()
    }

    /// [`read_i32`](Self::read_i32) wrapped in a transaction.
    pub fn read_i32_in_transaction(&mut self) -> Option<i32> {
        self.in_transaction(|s| Ok(s.read_i32())).ok().flatten()
    }

    /// [`read_i64`](Self::read_i64) wrapped in a transaction.
    pub fn read_i64_in_transaction(&mut self) -> Option<i64> {
        self.in_transaction(|s| Ok(s.read_i64())).ok().flatten()
    }

    /// [`read_string`](Self::read_string) wrapped in a transaction.
    pub fn read_string_in_transaction(&mut self) -> Result<Option<String>> {
        self.in_transaction(Self::read_string)
    }
}

impl Default for ByteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("buffered", &self.buffer.len())
            .field("cursor", &self.cursor)
            .field("transactions", &self.transactions)
            .finish()
    }
}
