//! Completion-server adapter.
//!
//! Request frames (worker-bound):
//! ```text
//! cmpl|defs|hovr|usgs|args|syms : String(id) String(file) Int32(column) Int32(line) String(source)
//! ping                          : String(id) String(message)
//! ```
//! Response frames:
//! ```text
//! RSLT : String(id) String(json)
//! PONG : String(id) String(message)
//! EROR : String(command) String(id) String(trace)
//! ```

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{read_error_frame, read_strings, AdapterEvents, Core, ERROR_TAG};
use crate::codec::JsonCodec;
use crate::error::{Result, SockwireError};
use crate::handler::{CloseReason, Dispatch, Dispatched, Handshake};
use crate::protocol::{ByteStream, FrameBuilder, Tag};
use crate::writer::WriterHandle;

const RESULT_TAG: Tag = Tag::new(*b"RSLT");
const PONG_TAG: Tag = Tag::new(*b"PONG");
const PING_TAG: Tag = Tag::new(*b"ping");

/// Request kinds understood by the completion server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionCommand {
    /// Completion items at a position.
    Completions,
    /// Go-to-definition targets.
    Definitions,
    /// Hover documentation.
    Hover,
    /// References to the symbol at a position.
    Usages,
    /// Signature help for the call at a position.
    Arguments,
    /// Symbols defined in the document.
    Symbols,
}

impl CompletionCommand {
    /// Every command, in wire-tag order.
    pub const ALL: [CompletionCommand; 6] = [
        CompletionCommand::Completions,
        CompletionCommand::Definitions,
        CompletionCommand::Hover,
        CompletionCommand::Usages,
        CompletionCommand::Arguments,
        CompletionCommand::Symbols,
    ];

    /// The worker-bound tag.
    pub const fn tag(self) -> Tag {
        match self {
            CompletionCommand::Completions => Tag::new(*b"cmpl"),
            CompletionCommand::Definitions => Tag::new(*b"defs"),
            CompletionCommand::Hover => Tag::new(*b"hovr"),
            CompletionCommand::Usages => Tag::new(*b"usgs"),
            CompletionCommand::Arguments => Tag::new(*b"args"),
            CompletionCommand::Symbols => Tag::new(*b"syms"),
        }
    }
}

impl fmt::Display for CompletionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for CompletionCommand {
    type Err = SockwireError;

    fn from_str(s: &str) -> Result<Self> {
        let tag = Tag::try_from(s)?;
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.tag() == tag)
            .ok_or_else(|| SockwireError::Protocol(format!("unknown completion command {s:?}")))
    }
}

/// Reply decoded for a completion request.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionReply {
    /// `RSLT` payload.
    Result(Value),
    /// `PONG` message.
    Pong(String),
}

/// Response tags this adapter listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Response {
    Result,
    Pong,
    Error,
}

impl Response {
    fn from_tag(tag: Tag) -> Option<Self> {
        match tag {
            RESULT_TAG => Some(Response::Result),
            PONG_TAG => Some(Response::Pong),
            ERROR_TAG => Some(Response::Error),
            _ => None,
        }
    }
}

/// Create a completion adapter.
///
/// Pass the dispatcher to [`spawn_session`](crate::handler::spawn_session);
/// keep the client for requests.
pub fn completion_adapter() -> (CompletionClient, CompletionDispatcher, AdapterEvents) {
    let (core, events) = Core::new();
    (
        CompletionClient { core: core.clone() },
        CompletionDispatcher { core },
        events,
    )
}

/// Request side of the completion adapter.
#[derive(Clone)]
pub struct CompletionClient {
    core: Arc<Core<CompletionReply>>,
}

impl CompletionClient {
    /// Ask the worker for `command` at `(line, column)` of `file`.
    ///
    /// The frame is written immediately; the returned future only waits for
    /// the reply. If `token` fires, or the future is dropped, the request is
    /// removed locally and a late reply is discarded.
    ///
    /// # Errors
    ///
    /// `NotConnected`/`ConnectionClosed` without a live worker, `Worker` for
    /// an error frame naming this request, `Decode` for a malformed JSON
    /// payload, `Cancelled` when the token fires.
    pub fn get_result(
        &self,
        command: CompletionCommand,
        token: Option<CancellationToken>,
        file: &str,
        column: i32,
        line: i32,
        source: &str,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let pending = self.core.issue(|id| {
            FrameBuilder::command(command.tag())
                .write_string(id)
                .write_string(file)
                .write_i32(column)
                .write_i32(line)
                .write_string(source)
                .finish()
        });
        async move {
            let pending = pending?;
            let reply = match token {
                Some(token) => pending.cancellable(token).await?,
                None => pending.await?,
            };
            match reply {
                CompletionReply::Result(value) => Ok(value),
                CompletionReply::Pong(_) => Err(SockwireError::UnexpectedReply("completion")),
            }
        }
    }

    /// Round-trip `message` through the worker.
    pub fn ping(&self, message: &str) -> impl Future<Output = Result<String>> + Send + 'static {
        let pending = self.core.issue(|id| {
            FrameBuilder::command(PING_TAG)
                .write_string(id)
                .write_string(message)
                .finish()
        });
        async move {
            match pending?.await? {
                CompletionReply::Pong(message) => Ok(message),
                CompletionReply::Result(_) => Err(SockwireError::UnexpectedReply("ping")),
            }
        }
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.core.pending_requests()
    }

    /// Whether a worker connection is live.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}

/// Frame side of the completion adapter.
pub struct CompletionDispatcher {
    core: Arc<Core<CompletionReply>>,
}

impl Dispatch for CompletionDispatcher {
    fn dispatch(&mut self, tag: Tag, stream: &mut ByteStream) -> Result<Dispatched> {
        let Some(response) = Response::from_tag(tag) else {
            return Ok(Dispatched::UnknownTag);
        };

        match response {
            Response::Result => {
                let Some([id, json]) = read_strings::<2>(stream)? else {
                    return Ok(Dispatched::Incomplete);
                };
                let reply = JsonCodec::decode(&json).map(CompletionReply::Result);
                self.core.settle(&id, reply);
            }
            Response::Pong => {
                let Some([id, message]) = read_strings::<2>(stream)? else {
                    return Ok(Dispatched::Incomplete);
                };
                self.core.settle(&id, Ok(CompletionReply::Pong(message)));
            }
            Response::Error => {
                let Some(error) = read_error_frame(stream)? else {
                    return Ok(Dispatched::Incomplete);
                };
                self.core.on_error_frame(error);
            }
        }
        Ok(Dispatched::Complete)
    }

    fn on_connected(&mut self, writer: WriterHandle) {
        self.core.on_connected(writer);
    }

    fn on_handshake(&mut self, handshake: &Handshake) {
        self.core.on_handshake(handshake);
    }

    fn on_closed(&mut self, reason: &CloseReason) {
        self.core.on_closed(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterEvent;
    use crate::handler::ProtocolEngine;
    use crate::writer::spawn_writer_task;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    /// Engine wired to an in-memory peer.
    fn connected() -> (
        CompletionClient,
        ProtocolEngine<CompletionDispatcher>,
        DuplexStream,
        AdapterEvents,
    ) {
        let (client, dispatcher, events) = completion_adapter();
        let (local, peer) = duplex(64 * 1024);
        let (writer, _task) = spawn_writer_task(local);
        let mut engine = ProtocolEngine::new(dispatcher);
        engine.connected(writer);
        let handshake = FrameBuilder::raw().write_string("g").write_i32(1).finish();
        engine.on_data(&handshake).unwrap();
        (client, engine, peer, events)
    }

    fn result_frame(id: &str, json: &str) -> Bytes {
        FrameBuilder::command(RESULT_TAG)
            .write_string(id)
            .write_string(json)
            .finish()
    }

    fn error_frame(command: &str, id: &str, trace: &str) -> Bytes {
        FrameBuilder::command(ERROR_TAG)
            .write_string(command)
            .write_string(id)
            .write_string(trace)
            .finish()
    }

    async fn still_pending<F: Future + Unpin>(fut: &mut F) -> bool {
        tokio::time::timeout(Duration::from_millis(20), fut).await.is_err()
    }

    #[test]
    fn test_command_tags_parse() {
        for cmd in CompletionCommand::ALL {
            assert_eq!(cmd.to_string().parse::<CompletionCommand>().unwrap(), cmd);
        }
        assert_eq!("args".parse::<CompletionCommand>().unwrap(), CompletionCommand::Arguments);
        assert!("nope".parse::<CompletionCommand>().is_err());
        assert!("RSLT".parse::<CompletionCommand>().is_err());
    }

    #[tokio::test]
    async fn test_request_frame_layout() {
        let (client, _engine, mut peer, _events) = connected();
        let _pending = client.get_result(CompletionCommand::Hover, None, "a.py", 4, 10, "x = 1");

        let expected = FrameBuilder::command(Tag::new(*b"hovr"))
            .write_string("0")
            .write_string("a.py")
            .write_i32(4)
            .write_i32(10)
            .write_string("x = 1")
            .finish();
        let mut buf = vec![0u8; expected.len()];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (client, mut engine, _peer, _events) = connected();

        let mut first = Box::pin(client.get_result(CompletionCommand::Arguments, None, "f", 0, 0, "a("));
        let mut second = Box::pin(client.get_result(CompletionCommand::Arguments, None, "f", 0, 0, "b("));
        assert_eq!(client.pending_requests(), 2);

        engine.on_data(&result_frame("1", r#"{"sig":"b"}"#)).unwrap();
        assert_eq!(second.as_mut().await.unwrap()["sig"], "b");
        assert!(still_pending(&mut first).await);

        engine.on_data(&result_frame("0", r#"{"sig":"a"}"#)).unwrap();
        assert_eq!(first.await.unwrap()["sig"], "a");
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_decode_error_is_local() {
        let (client, mut engine, _peer, _events) = connected();

        let bad = client.get_result(CompletionCommand::Completions, None, "f", 0, 0, "");
        let good = client.get_result(CompletionCommand::Completions, None, "f", 0, 0, "");

        engine.on_data(&result_frame("0", "{oops")).unwrap();
        engine.on_data(&result_frame("1", "[]")).unwrap();

        assert!(matches!(bad.await, Err(SockwireError::Decode(_))));
        assert_eq!(good.await.unwrap(), serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_error_frame_with_empty_id_is_global() {
        let (client, mut engine, _peer, mut events) = connected();
        let mut pending = Box::pin(client.get_result(CompletionCommand::Definitions, None, "f", 1, 1, ""));

        engine.on_data(&error_frame("exit", "", "worker crashed")).unwrap();

        assert_eq!(events.recv().await, Some(AdapterEvent::Handshake(Handshake { guid: "g".into(), pid: 1 })));
        match events.recv().await {
            Some(AdapterEvent::CommandError(e)) => assert_eq!(e.trace, "worker crashed"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(still_pending(&mut pending).await);
        assert_eq!(client.pending_requests(), 1);
    }

    #[tokio::test]
    async fn test_error_frame_rejects_matching_request() {
        let (client, mut engine, _peer, _events) = connected();
        let pending = client.get_result(CompletionCommand::Usages, None, "f", 1, 1, "");

        engine.on_data(&error_frame("usgs", "0", "KeyError")).unwrap();

        let err = pending.await.unwrap_err();
        assert!(err.to_string().contains("KeyError"));
    }

    #[tokio::test]
    async fn test_cancel_then_late_response_is_dropped() {
        let (client, mut engine, _peer, _events) = connected();
        let token = CancellationToken::new();
        let pending = client.get_result(CompletionCommand::Hover, Some(token.clone()), "f", 0, 0, "");

        token.cancel();
        assert!(matches!(pending.await, Err(SockwireError::Cancelled)));
        assert_eq!(client.pending_requests(), 0);

        let progress = engine.on_data(&result_frame("0", "{}")).unwrap();
        assert_eq!(progress.frames, 1);
    }

    #[tokio::test]
    async fn test_timeout_cancels_request() {
        let (client, _engine, _peer, _events) = connected();
        let pending = client.get_result(CompletionCommand::Symbols, None, "f", 0, 0, "");

        assert!(tokio::time::timeout(Duration::from_millis(10), pending).await.is_err());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (client, mut engine, _peer, _events) = connected();
        let pong = client.ping("hello");
        engine
            .on_data(&FrameBuilder::command(PONG_TAG).write_string("0").write_string("hello").finish())
            .unwrap();
        assert_eq!(pong.await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_close_rejects_pending() {
        let (client, mut engine, _peer, _events) = connected();
        let pending = client.get_result(CompletionCommand::Hover, None, "f", 0, 0, "");

        engine.on_close(CloseReason::PeerClosed);

        assert!(matches!(pending.await, Err(SockwireError::ConnectionClosed)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_not_connected_before_worker() {
        let (client, _dispatcher, _events) = completion_adapter();
        let result = client.get_result(CompletionCommand::Hover, None, "f", 0, 0, "").await;
        assert!(matches!(result, Err(SockwireError::NotConnected)));
    }
}
