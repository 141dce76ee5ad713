//! Error types for sockwire.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::Tag;

/// Main error type for all sockwire operations.
#[derive(Debug, Error)]
pub enum SockwireError {
    /// I/O error during socket or process operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind the local listening socket.
    #[error("failed to bind socket server: {0}")]
    Bind(#[source] std::io::Error),

    /// A well-formed frame carried a payload that is not valid JSON for the
    /// expected shape. Local to the one request.
    #[error("payload decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Protocol violation inside a frame (bad marker, invalid UTF-8, oversized field).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The stream no longer aligns to frame boundaries.
    #[error("framing desync: unrecognized command tag {0}")]
    UnknownCommand(Tag),

    /// The worker reported a failure for a command.
    #[error("Command: {command}, Id: {id}, worker trace: {trace}")]
    Worker {
        /// Command name the worker was executing.
        command: String,
        /// Request id the failure refers to (may be empty).
        id: String,
        /// Worker-side traceback text.
        trace: String,
    },

    /// The reply decoded fine but does not belong to the request kind.
    #[error("unexpected reply to {0} request")]
    UnexpectedReply(&'static str),

    /// Connection closed while the request was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No worker connection is available yet.
    #[error("not connected to a worker")]
    NotConnected,

    /// The request was cancelled locally.
    #[error("request cancelled")]
    Cancelled,

    /// The kernel was restarted while the request was pending.
    #[error("kernel restarted")]
    KernelRestarted,

    /// The kernel was shut down while the request was pending.
    #[error("kernel shut down")]
    KernelShutdown,

    /// No kernel spec matches the requested display name.
    #[error("no kernel spec with display name {0:?}")]
    KernelSpecNotFound(String),

    /// The worker process could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The worker did not become ready in time.
    #[error("worker not ready after {0:?}")]
    StartupTimeout(Duration),

    /// The worker exited (or closed stdout) before it became ready.
    #[error("worker exited before becoming ready")]
    WorkerExited,

    /// A request method was called before `start`.
    #[error("worker not started")]
    NotStarted,

    /// `start` was called on a supervisor that is already running.
    #[error("worker already started")]
    AlreadyStarted,
}

/// Result type alias using SockwireError.
pub type Result<T> = std::result::Result<T, SockwireError>;
