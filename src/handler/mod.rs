//! Handler module - protocol engine and frame dispatch.
//!
//! Provides:
//! - [`ProtocolEngine`] - handshake state machine and frame loop for one connection
//! - [`Dispatch`] - the seam adapters implement to decode their response tags
//! - [`HandlerRegistry`] - a `Dispatch` built from tag-keyed handler closures
//! - [`spawn_session`] - runs an engine against a socket server's events
//!
//! # Example
//!
//! ```ignore
//! use sockwire::handler::{spawn_session, Decoded, HandlerRegistry};
//! use sockwire::protocol::Tag;
//! use sockwire::transport::SocketServer;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(Tag::new(*b"PONG"), |stream| {
//!     let Some(message) = stream.read_string()? else {
//!         return Ok(Decoded::Incomplete);
//!     };
//!     println!("pong: {message}");
//!     Ok(Decoded::Complete)
//! });
//!
//! let (server, events) = SocketServer::start().await?;
//! let (_task, handshake) = spawn_session(server.handle(), events, registry, u64::MAX);
//! let handshake = handshake.await?;
//! ```

mod engine;
mod registry;
mod session;

pub use engine::{EngineState, Progress, ProtocolEngine};
pub use registry::{CloseReason, Decoded, Dispatch, Dispatched, Handler, HandlerRegistry, Handshake};
pub use session::spawn_session;
