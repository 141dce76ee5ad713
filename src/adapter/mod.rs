//! Adapters - worker-specific command vocabularies over the protocol engine.
//!
//! An adapter is split in two halves sharing one correlation table:
//! - a client (`CompletionClient`, `KernelClient`) with async request
//!   methods, cheap to clone and safe to call from any task;
//! - a dispatcher (`CompletionDispatcher`, `KernelDispatcher`) that the
//!   session task drives with decoded frames.
//!
//! Connection-level notifications arrive on an [`AdapterEvents`] channel.

pub mod completion;
pub mod kernel;
mod pending;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

pub use pending::{CorrelationTable, Pending, Ticket};

use crate::error::{Result, SockwireError};
use crate::handler::{CloseReason, Handshake};
use crate::protocol::{ByteStream, Tag};
use crate::writer::WriterHandle;
use pending::CancelRequest;

/// Command tag of the error frame shared by every vocabulary.
pub const ERROR_TAG: Tag = Tag::new(*b"EROR");

/// Failure reported by the worker in an error frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// Command the worker was running.
    pub command: String,
    /// Request id, empty for connection-wide failures.
    pub id: String,
    /// Worker-side traceback.
    pub trace: String,
}

impl From<CommandError> for SockwireError {
    fn from(e: CommandError) -> Self {
        SockwireError::Worker {
            command: e.command,
            id: e.id,
            trace: e.trace,
        }
    }
}

/// Which kernel channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Request/reply channel.
    Shell,
    /// Broadcast output channel.
    IoPub,
}

/// Connection-level notification.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// The worker completed its handshake.
    Handshake(Handshake),
    /// A worker error that names no outstanding request.
    CommandError(CommandError),
    /// Kernel execution state changed (`busy`, `idle`, ...).
    KernelStatus(String),
    /// A kernel message could not be parsed as JSON.
    MessageParseError {
        /// Channel the message arrived on.
        channel: Channel,
        /// Parser error text.
        error: String,
        /// The raw payload.
        payload: String,
    },
    /// The connection closed; every outstanding request was rejected.
    Closed(CloseReason),
}

/// Receiver for adapter notifications.
pub type AdapterEvents = mpsc::UnboundedReceiver<AdapterEvent>;

/// State shared by an adapter's client and dispatcher halves.
pub(crate) struct Core<R> {
    inner: Mutex<Inner<R>>,
    events: mpsc::UnboundedSender<AdapterEvent>,
}

struct Inner<R> {
    table: CorrelationTable<R>,
    writer: Option<WriterHandle>,
    closed: bool,
}

impl<R: Send + 'static> Core<R> {
    pub(crate) fn new() -> (Arc<Self>, AdapterEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            inner: Mutex::new(Inner {
                table: CorrelationTable::new(),
                writer: None,
                closed: false,
            }),
            events,
        });
        (core, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request and send the frame `build` produces for its id.
    pub(crate) fn issue(self: &Arc<Self>, build: impl FnOnce(&str) -> Bytes) -> Result<Pending<R>> {
        let mut inner = self.lock();
        let writer = match (&inner.writer, inner.closed) {
            (Some(writer), _) => writer.clone(),
            (None, true) => return Err(SockwireError::ConnectionClosed),
            (None, false) => return Err(SockwireError::NotConnected),
        };

        let (ticket, rx) = inner.table.open();
        if let Err(e) = writer.send(build(ticket.id())) {
            inner.table.cancel(&ticket);
            return Err(e);
        }
        drop(inner);

        let owner: Arc<dyn CancelRequest> = self.clone();
        Ok(Pending::new(ticket, rx, owner))
    }

    /// Settle the request `id`; responses for unknown ids are dropped.
    pub(crate) fn settle(&self, id: &str, result: Result<R>) -> bool {
        let settled = self.lock().table.settle(id, result);
        if !settled {
            tracing::debug!(id, "dropping response for unknown or cancelled request");
        }
        settled
    }

    /// Run `f` against the table under the lock.
    pub(crate) fn with_table<T>(&self, f: impl FnOnce(&mut CorrelationTable<R>) -> T) -> T {
        f(&mut self.lock().table)
    }

    /// Route a worker error to its request, or publish it.
    pub(crate) fn on_error_frame(&self, error: CommandError) {
        if !error.id.is_empty() {
            let id = error.id.clone();
            let mut inner = self.lock();
            if inner.table.contains(&id) {
                inner.table.reject(&id, error.into());
                return;
            }
        }
        tracing::warn!(command = %error.command, id = %error.id, trace = %error.trace, "worker reported an error");
        self.emit(AdapterEvent::CommandError(error));
    }

    pub(crate) fn on_connected(&self, writer: WriterHandle) {
        self.lock().writer = Some(writer);
    }

    pub(crate) fn on_handshake(&self, handshake: &Handshake) {
        self.emit(AdapterEvent::Handshake(handshake.clone()));
    }

    pub(crate) fn on_closed(&self, reason: &CloseReason) {
        let rejected = {
            let mut inner = self.lock();
            inner.writer = None;
            inner.closed = true;
            inner.table.reject_all(|| SockwireError::ConnectionClosed)
        };
        if rejected > 0 {
            tracing::debug!(rejected, "rejected outstanding requests on close");
        }
        self.emit(AdapterEvent::Closed(reason.clone()));
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock().writer.is_some()
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.lock().table.len()
    }
}

impl<R: Send + 'static> CancelRequest for Core<R> {
    fn cancel(&self, ticket: &Ticket) {
        self.lock().table.cancel(ticket);
    }
}

/// Read `N` string fields, or `None` if any is incomplete.
pub(crate) fn read_strings<const N: usize>(stream: &mut ByteStream) -> Result<Option<[String; N]>> {
    let mut fields: [String; N] = std::array::from_fn(|_| String::new());
    for field in &mut fields {
        let Some(value) = stream.read_string()? else {
            return Ok(None);
        };
        *field = value;
    }
    Ok(Some(fields))
}

/// Read the body of an error frame: command, id, trace.
pub(crate) fn read_error_frame(stream: &mut ByteStream) -> Result<Option<CommandError>> {
    Ok(read_strings::<3>(stream)?.map(|[command, id, trace]| CommandError { command, id, trace }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuilder;
    use crate::writer::spawn_writer_task;
    use tokio::io::duplex;

    #[test]
    fn test_read_strings_incomplete() {
        let bytes = FrameBuilder::raw().write_string("a").write_string("bc").finish();
        let mut stream = ByteStream::new();
        stream.append(&bytes[..bytes.len() - 1]);
        assert_eq!(read_strings::<2>(&mut stream).unwrap(), None);

        let mut stream = ByteStream::new();
        stream.append(&bytes);
        assert_eq!(
            read_strings::<2>(&mut stream).unwrap(),
            Some(["a".to_string(), "bc".to_string()])
        );
    }

    #[test]
    fn test_command_error_into_worker_error() {
        let err: SockwireError = CommandError {
            command: "args".into(),
            id: "3".into(),
            trace: "Traceback".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Command: args, Id: 3, worker trace: Traceback");
    }

    #[tokio::test]
    async fn test_issue_before_connect_is_not_connected() {
        let (core, _events) = Core::<()>::new();
        let result = core.issue(|_| Bytes::new());
        assert!(matches!(result, Err(SockwireError::NotConnected)));
    }

    #[tokio::test]
    async fn test_issue_after_close_is_connection_closed() {
        let (core, mut events) = Core::<()>::new();
        core.on_closed(&CloseReason::PeerClosed);
        assert!(matches!(core.issue(|_| Bytes::new()), Err(SockwireError::ConnectionClosed)));
        assert_eq!(events.recv().await, Some(AdapterEvent::Closed(CloseReason::PeerClosed)));
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding() {
        let (client, _server) = duplex(1024);
        let (writer, _task) = spawn_writer_task(client);
        let (core, _events) = Core::<()>::new();
        core.on_connected(writer);

        let pending = core.issue(|id| Bytes::copy_from_slice(id.as_bytes())).unwrap();
        assert_eq!(core.pending_requests(), 1);

        core.on_closed(&CloseReason::PeerClosed);
        assert!(matches!(pending.await, Err(SockwireError::ConnectionClosed)));
        assert_eq!(core.pending_requests(), 0);
        assert!(!core.is_connected());
    }

    #[tokio::test]
    async fn test_error_frame_routing() {
        let (client, _server) = duplex(1024);
        let (writer, _task) = spawn_writer_task(client);
        let (core, mut events) = Core::<()>::new();
        core.on_connected(writer);

        let pending = core.issue(|_| Bytes::from_static(b"x")).unwrap();
        let id = pending.id().to_string();

        // Empty id: connection-wide, published as an event.
        let global = CommandError {
            command: "exit".into(),
            id: String::new(),
            trace: "boom".into(),
        };
        core.on_error_frame(global.clone());
        assert_eq!(events.recv().await, Some(AdapterEvent::CommandError(global)));
        assert_eq!(core.pending_requests(), 1);

        // Matching id: rejects that request only.
        core.on_error_frame(CommandError {
            command: "args".into(),
            id,
            trace: "trace".into(),
        });
        assert!(matches!(pending.await, Err(SockwireError::Worker { trace, .. }) if trace == "trace"));
    }
}
