//! Session task: drives one protocol engine from socket server events.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::engine::{EngineState, ProtocolEngine};
use super::registry::{CloseReason, Dispatch, Handshake};
use crate::transport::{ConnectionId, ServerEvent, ServerHandle};

/// Spawn a task that feeds server events into a [`ProtocolEngine`].
///
/// The first connection is served; any later connection is closed on
/// arrival. On a protocol failure the connection is closed through
/// `server`. The task ends when the served connection closes or the event
/// stream ends, after the dispatcher has seen `on_closed`.
///
/// The returned receiver resolves once, when the handshake completes. It
/// errors if the session ends first.
pub fn spawn_session<D: Dispatch>(
    server: ServerHandle,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    dispatcher: D,
    max_string_length: u64,
) -> (JoinHandle<()>, oneshot::Receiver<Handshake>) {
    let (handshake_tx, handshake_rx) = oneshot::channel();
    let engine = ProtocolEngine::with_max_string_length(dispatcher, max_string_length);
    let task = tokio::spawn(run_session(server, events, engine, handshake_tx));
    (task, handshake_rx)
}

async fn run_session<D: Dispatch>(
    server: ServerHandle,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    mut engine: ProtocolEngine<D>,
    handshake_tx: oneshot::Sender<Handshake>,
) {
    let mut handshake_tx = Some(handshake_tx);
    let mut active: Option<ConnectionId> = None;

    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Connected { id, peer, writer } => {
                if active.is_some() || engine.state() == EngineState::Closed {
                    tracing::warn!(connection = id, %peer, "rejecting extra worker connection");
                    server.close_connection(id);
                    continue;
                }
                active = Some(id);
                engine.connected(writer);
            }
            ServerEvent::Data { id, data } if active == Some(id) => match engine.on_data(&data) {
                Ok(progress) => {
                    if let Some(handshake) = progress.handshake {
                        tracing::info!(guid = %handshake.guid, pid = handshake.pid, "worker handshake complete");
                        if let Some(tx) = handshake_tx.take() {
                            let _ = tx.send(handshake);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(connection = id, error = %e, "closing worker connection");
                    server.close_connection(id);
                }
            },
            ServerEvent::Closed { id } if active == Some(id) => {
                engine.on_close(CloseReason::PeerClosed);
                break;
            }
            ServerEvent::Data { .. } | ServerEvent::Closed { .. } => {}
        }
    }

    engine.on_close(CloseReason::Disposed);
}
