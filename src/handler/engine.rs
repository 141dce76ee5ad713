//! Per-connection protocol engine.
//!
//! Owns the connection's [`ByteStream`], runs the handshake state machine
//! and feeds tagged frames to a [`Dispatch`] implementation:
//!
//! ```text
//! AwaitingHandshake ──(guid + pid parsed)──► Ready ──(close / desync)──► Closed
//!         └──────────────────(close)─────────────────────────────────────┘
//! ```
//!
//! Parsing is synchronous and non-reentrant: one `on_data` call decodes as
//! many frames as the buffered bytes allow, one at a time, in order.

use super::registry::{CloseReason, Dispatch, Dispatched, Handshake};
use crate::error::{Result, SockwireError};
use crate::protocol::{ByteStream, DEFAULT_MAX_STRING_LENGTH};
use crate::writer::WriterHandle;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting for the worker's GUID and pid.
    AwaitingHandshake,
    /// Routing tagged frames to the dispatcher.
    Ready,
    /// Terminal. Further data is ignored.
    Closed,
}

/// What one `on_data` call achieved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Set on the call that completed the handshake.
    pub handshake: Option<Handshake>,
    /// Number of tagged frames dispatched.
    pub frames: usize,
}

/// Protocol engine for one connection.
pub struct ProtocolEngine<D> {
    stream: ByteStream,
    state: EngineState,
    guid: Option<String>,
    pid: Option<i32>,
    dispatcher: D,
}

impl<D: Dispatch> ProtocolEngine<D> {
    /// Create an engine in `AwaitingHandshake`.
    pub fn new(dispatcher: D) -> Self {
        Self::with_max_string_length(dispatcher, DEFAULT_MAX_STRING_LENGTH)
    }

    /// Create an engine with a custom string field limit.
    pub fn with_max_string_length(dispatcher: D, max_string_length: u64) -> Self {
        Self {
            stream: ByteStream::with_max_string_length(max_string_length),
            state: EngineState::AwaitingHandshake,
            guid: None,
            pid: None,
            dispatcher,
        }
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The completed handshake, once `Ready`.
    pub fn handshake(&self) -> Option<Handshake> {
        match (&self.guid, self.pid) {
            (Some(guid), Some(pid)) => Some(Handshake {
                guid: guid.clone(),
                pid,
            }),
            _ => None,
        }
    }

    /// Get a reference to the dispatcher.
    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Get a mutable reference to the dispatcher.
    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    /// Unread buffered bytes.
    pub fn buffered(&self) -> usize {
        self.stream.remaining()
    }

    /// Hand the connection's writer to the dispatcher.
    pub fn connected(&mut self, writer: WriterHandle) {
        self.dispatcher.on_connected(writer);
    }

    /// Feed bytes from the socket.
    ///
    /// # Errors
    ///
    /// An unknown tag, a malformed field, or a dispatcher that leaves the
    /// stream off a frame boundary moves the engine to `Closed`, notifies
    /// the dispatcher and returns the error. The caller must close the
    /// socket.
    pub fn on_data(&mut self, data: &[u8]) -> Result<Progress> {
        let mut progress = Progress::default();
        if self.state == EngineState::Closed {
            tracing::debug!(bytes = data.len(), "ignoring data on closed connection");
            return Ok(progress);
        }
        self.stream.append(data);

        if self.state == EngineState::AwaitingHandshake {
            match self.read_handshake() {
                Ok(Some(handshake)) => {
                    tracing::debug!(guid = %handshake.guid, pid = handshake.pid, "handshake complete");
                    self.state = EngineState::Ready;
                    self.dispatcher.on_handshake(&handshake);
                    progress.handshake = Some(handshake);
                }
                Ok(None) => return Ok(progress),
                Err(e) => return Err(self.fail(e)),
            }
        }

        while self.state == EngineState::Ready {
            match self.next_frame() {
                Ok(true) => progress.frames += 1,
                Ok(false) => break,
                Err(e) => return Err(self.fail(e)),
            }
        }

        self.stream.compact();
        Ok(progress)
    }

    /// The transport closed. Idempotent.
    pub fn on_close(&mut self, reason: CloseReason) {
        if self.state == EngineState::Closed {
            return;
        }
        self.state = EngineState::Closed;
        self.stream.clear();
        self.dispatcher.on_closed(&reason);
    }

    /// Each handshake field is read at most once, in its own transaction.
    fn read_handshake(&mut self) -> Result<Option<Handshake>> {
        if self.guid.is_none() {
            let Some(guid) = self.stream.read_string_in_transaction()? else {
                return Ok(None);
            };
            self.guid = Some(guid);
        }
        if self.pid.is_none() {
            let Some(pid) = self.stream.read_i32_in_transaction() else {
                return Ok(None);
            };
            self.pid = Some(pid);
        }
        Ok(self.handshake())
    }

    /// Decode one tagged frame. `Ok(false)` means more bytes are needed.
    fn next_frame(&mut self) -> Result<bool> {
        let depth = self.stream.transaction_depth();
        self.stream.begin_transaction();

        let Some(tag) = self.stream.read_tag() else {
            self.stream.rollback_transaction();
            return Ok(false);
        };

        let outcome = self.dispatcher.dispatch(tag, &mut self.stream);

        if self.stream.transaction_depth() != depth + 1 {
            return Err(SockwireError::Protocol(format!(
                "handler for {tag} left the stream with unbalanced transactions"
            )));
        }

        match outcome {
            Ok(Dispatched::Complete) => {
                self.stream.end_transaction();
                Ok(true)
            }
            Ok(Dispatched::Incomplete) => {
                self.stream.rollback_transaction();
                Ok(false)
            }
            Ok(Dispatched::UnknownTag) => {
                self.stream.rollback_transaction();
                Err(SockwireError::UnknownCommand(tag))
            }
            Err(e) => {
                self.stream.rollback_transaction();
                Err(e)
            }
        }
    }

    fn fail(&mut self, error: SockwireError) -> SockwireError {
        let reason = match &error {
            SockwireError::UnknownCommand(tag) => {
                tracing::error!(%tag, "unrecognized command tag, stream is out of alignment");
                CloseReason::FramingDesync { tag: *tag }
            }
            other => {
                tracing::error!(error = %other, "protocol violation");
                CloseReason::Protocol(other.to_string())
            }
        };
        self.on_close(reason);
        error
    }
}

impl<D> std::fmt::Debug for ProtocolEngine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("state", &self.state)
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Decoded, HandlerRegistry};
    use crate::protocol::{FrameBuilder, Tag};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    const PING: Tag = Tag::new(*b"ping");

    fn handshake_bytes() -> Bytes {
        FrameBuilder::raw()
            .write_string("6f9619ff-8b86-d011-b42d-00c04fc964ff")
            .write_i32(4242)
            .finish()
    }

    fn ping_frame(msg: &str) -> Bytes {
        FrameBuilder::command(PING).write_string(msg).finish()
    }

    /// Registry with a `ping` handler recording each message.
    fn recording_registry() -> (HandlerRegistry, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut registry = HandlerRegistry::new();
        registry.register(PING, move |stream| {
            let Some(msg) = stream.read_string()? else {
                return Ok(Decoded::Incomplete);
            };
            sink.lock().unwrap().push(msg);
            Ok(Decoded::Complete)
        });
        (registry, seen)
    }

    /// Dispatcher recording lifecycle hooks.
    #[derive(Default)]
    struct Hooks {
        handshakes: Vec<Handshake>,
        closed: Vec<CloseReason>,
    }

    impl Dispatch for Hooks {
        fn dispatch(&mut self, _tag: Tag, _stream: &mut ByteStream) -> Result<Dispatched> {
            Ok(Dispatched::UnknownTag)
        }
        fn on_handshake(&mut self, handshake: &Handshake) {
            self.handshakes.push(handshake.clone());
        }
        fn on_closed(&mut self, reason: &CloseReason) {
            self.closed.push(reason.clone());
        }
    }

    #[test]
    fn test_handshake_split_across_reads() {
        let mut engine = ProtocolEngine::new(Hooks::default());
        let bytes = handshake_bytes();

        let first = engine.on_data(&bytes[..5]).unwrap();
        assert_eq!(first.handshake, None);
        assert_eq!(engine.state(), EngineState::AwaitingHandshake);

        let second = engine.on_data(&bytes[5..]).unwrap();
        let handshake = second.handshake.unwrap();
        assert_eq!(handshake.pid, 4242);
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.dispatcher().handshakes.len(), 1);
    }

    #[test]
    fn test_handshake_guid_then_pid() {
        let mut engine = ProtocolEngine::new(Hooks::default());
        let bytes = handshake_bytes();
        let split = bytes.len() - 4;

        // guid complete, pid missing: guid is kept, not re-read
        assert!(engine.on_data(&bytes[..split]).unwrap().handshake.is_none());
        assert_eq!(engine.buffered(), 0);

        let progress = engine.on_data(&bytes[split..]).unwrap();
        assert_eq!(
            progress.handshake.unwrap().guid,
            "6f9619ff-8b86-d011-b42d-00c04fc964ff"
        );
    }

    #[test]
    fn test_handshake_byte_at_a_time_emits_once() {
        let mut engine = ProtocolEngine::new(Hooks::default());
        let mut count = 0;
        for byte in handshake_bytes().iter() {
            if engine.on_data(&[*byte]).unwrap().handshake.is_some() {
                count += 1;
            }
        }
        assert_eq!(count, 1);
        assert_eq!(engine.dispatcher().handshakes.len(), 1);
    }

    #[test]
    fn test_no_dispatch_before_handshake() {
        let (registry, seen) = recording_registry();
        let mut engine = ProtocolEngine::new(registry);
        let bytes = handshake_bytes();

        // Command bytes spliced after a partial handshake.
        let mut data = bytes[..bytes.len() - 1].to_vec();
        assert_eq!(engine.on_data(&data).unwrap().frames, 0);
        assert!(seen.lock().unwrap().is_empty());

        data.clear();
        data.push(bytes[bytes.len() - 1]);
        data.extend_from_slice(&ping_frame("one"));
        data.extend_from_slice(&ping_frame("two"));
        let progress = engine.on_data(&data).unwrap();

        assert!(progress.handshake.is_some());
        assert_eq!(progress.frames, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_frames_split_across_reads() {
        let (registry, seen) = recording_registry();
        let mut engine = ProtocolEngine::new(registry);
        engine.on_data(&handshake_bytes()).unwrap();

        let mut stream_bytes = Vec::new();
        for msg in ["a", "", "ünïcode", "last"] {
            stream_bytes.extend_from_slice(&ping_frame(msg));
        }

        let mut frames = 0;
        for chunk in stream_bytes.chunks(3) {
            frames += engine.on_data(chunk).unwrap().frames;
        }
        assert_eq!(frames, 4);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "", "ünïcode", "last"]);
        assert_eq!(engine.buffered(), 0);
    }

    #[test]
    fn test_unknown_tag_closes() {
        let mut engine = ProtocolEngine::new(Hooks::default());
        engine.on_data(&handshake_bytes()).unwrap();

        let err = engine.on_data(b"WHAT").unwrap_err();
        assert!(matches!(err, SockwireError::UnknownCommand(tag) if tag == Tag::new(*b"WHAT")));
        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(
            engine.dispatcher().closed,
            vec![CloseReason::FramingDesync {
                tag: Tag::new(*b"WHAT")
            }]
        );

        // Further data is ignored and close is not reported twice.
        assert_eq!(engine.on_data(b"more").unwrap(), Progress::default());
        engine.on_close(CloseReason::PeerClosed);
        assert_eq!(engine.dispatcher().closed.len(), 1);
    }

    #[test]
    fn test_malformed_field_closes() {
        let (registry, _seen) = recording_registry();
        let mut engine = ProtocolEngine::new(registry);
        engine.on_data(&handshake_bytes()).unwrap();

        let err = engine.on_data(b"pingX\0\0\0\0\0\0\0\0").unwrap_err();
        assert!(matches!(err, SockwireError::Protocol(_)));
        assert_eq!(engine.state(), EngineState::Closed);
    }

    #[test]
    fn test_malformed_handshake_closes() {
        let mut engine = ProtocolEngine::new(Hooks::default());
        assert!(engine.on_data(b"Z\0\0\0\0\0\0\0\0").is_err());
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(matches!(
            engine.dispatcher().closed.as_slice(),
            [CloseReason::Protocol(_)]
        ));
    }

    #[test]
    fn test_unbalanced_handler_closes() {
        let mut registry = HandlerRegistry::new();
        registry.register(PING, |stream| {
            stream.begin_transaction();
            Ok(Decoded::Complete)
        });
        let mut engine = ProtocolEngine::new(registry);
        engine.on_data(&handshake_bytes()).unwrap();

        assert!(engine.on_data(b"ping").is_err());
        assert_eq!(engine.state(), EngineState::Closed);
    }

    #[test]
    fn test_close_reports_once() {
        let mut engine = ProtocolEngine::new(Hooks::default());
        engine.on_close(CloseReason::PeerClosed);
        engine.on_close(CloseReason::Disposed);
        assert_eq!(engine.dispatcher().closed, vec![CloseReason::PeerClosed]);
        assert_eq!(engine.handshake(), None);
    }
}
