//! Dispatch seam between the protocol engine and command vocabularies.
//!
//! The engine reads the 4-byte tag of each frame and hands the stream to a
//! [`Dispatch`] implementation, which reads the rest of the frame. Adapters
//! implement `Dispatch` over a closed enum of their response tags;
//! [`HandlerRegistry`] implements it over a tag-keyed handler map for
//! vocabularies assembled at runtime.
//!
//! # Example
//!
//! ```
//! use sockwire::handler::{Decoded, HandlerRegistry};
//! use sockwire::protocol::Tag;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(Tag::new(*b"PONG"), |stream| {
//!     let Some(_id) = stream.read_string()? else {
//!         return Ok(Decoded::Incomplete);
//!     };
//!     Ok(Decoded::Complete)
//! });
//! assert!(registry.contains(Tag::new(*b"PONG")));
//! ```

use std::collections::HashMap;

use crate::error::Result;
use crate::protocol::{ByteStream, Tag};
use crate::writer::WriterHandle;

/// Outcome of decoding one frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// The whole frame was read.
    Complete,
    /// More bytes are needed; the engine rolls back and waits.
    Incomplete,
}

/// Outcome of dispatching one tagged frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// The whole frame was read and handled.
    Complete,
    /// More bytes are needed.
    Incomplete,
    /// No handler knows this tag; the stream is out of alignment.
    UnknownTag,
}

impl From<Decoded> for Dispatched {
    fn from(decoded: Decoded) -> Self {
        match decoded {
            Decoded::Complete => Dispatched::Complete,
            Decoded::Incomplete => Dispatched::Incomplete,
        }
    }
}

/// Worker identity sent before any tagged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Session GUID chosen by the worker.
    pub guid: String,
    /// Worker process id.
    pub pid: i32,
}

/// Why a connection's engine reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket or the read failed.
    PeerClosed,
    /// An unrecognized tag arrived.
    FramingDesync {
        /// The tag that could not be dispatched.
        tag: Tag,
    },
    /// A frame violated the wire format.
    Protocol(String),
    /// The owner shut the connection down.
    Disposed,
}

/// Frame dispatcher driven by a [`ProtocolEngine`](super::ProtocolEngine).
///
/// `dispatch` is called with the stream positioned right after the tag. It
/// must either read exactly one frame body and return `Complete`, or return
/// `Incomplete` without side effects. The engine wraps every call in a
/// transaction, so partial reads are undone for it.
pub trait Dispatch: Send + 'static {
    /// Decode and handle the frame body for `tag`.
    fn dispatch(&mut self, tag: Tag, stream: &mut ByteStream) -> Result<Dispatched>;

    /// A worker connected; frames for it go through `writer`.
    fn on_connected(&mut self, _writer: WriterHandle) {}

    /// The handshake completed.
    fn on_handshake(&mut self, _handshake: &Handshake) {}

    /// The connection is gone. Called at most once.
    fn on_closed(&mut self, _reason: &CloseReason) {}
}

/// A handler for one command tag.
pub trait Handler: Send + 'static {
    /// Read one frame body.
    fn call(&mut self, stream: &mut ByteStream) -> Result<Decoded>;
}

impl<F> Handler for F
where
    F: FnMut(&mut ByteStream) -> Result<Decoded> + Send + 'static,
{
    fn call(&mut self, stream: &mut ByteStream) -> Result<Decoded> {
        self(stream)
    }
}

/// Registry mapping command tags to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Tag, Box<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `tag`.
    ///
    /// A later registration for the same tag replaces the earlier one;
    /// returns `true` when that happened.
    pub fn register<F>(&mut self, tag: Tag, handler: F) -> bool
    where
        F: FnMut(&mut ByteStream) -> Result<Decoded> + Send + 'static,
    {
        self.handlers.insert(tag, Box::new(handler)).is_some()
    }

    /// Remove the handler for `tag`.
    pub fn unregister(&mut self, tag: Tag) -> bool {
        self.handlers.remove(&tag).is_some()
    }

    /// Check if a tag has a handler.
    pub fn contains(&self, tag: Tag) -> bool {
        self.handlers.contains_key(&tag)
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Dispatch for HandlerRegistry {
    fn dispatch(&mut self, tag: Tag, stream: &mut ByteStream) -> Result<Dispatched> {
        match self.handlers.get_mut(&tag) {
            Some(handler) => handler.call(stream).map(Dispatched::from),
            None => Ok(Dispatched::UnknownTag),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tags", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
