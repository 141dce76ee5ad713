//! Transport module - localhost TCP socket server.
//!
//! The worker receives the port as a command-line argument and connects
//! back; the server only moves bytes.

mod server;

pub use server::{ConnectionId, ServerEvent, ServerHandle, SocketServer};
