//! Localhost TCP server that republishes socket activity as events.
//!
//! The server binds `127.0.0.1:0`, reports the OS-assigned port, and for
//! every accepted connection spawns a reader task and a writer task. Raw
//! bytes are forwarded untouched; parsing belongs to the protocol engine.
//!
//! # Example
//!
//! ```ignore
//! use sockwire::transport::{ServerEvent, SocketServer};
//!
//! let (server, mut events) = SocketServer::start().await?;
//! spawn_worker(server.port());
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ServerEvent::Connected { id, .. } => println!("worker {id} connected"),
//!         ServerEvent::Data { data, .. } => println!("{} bytes", data.len()),
//!         ServerEvent::Closed { id } => println!("worker {id} gone"),
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SockwireError};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Read buffer reserve per socket read.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Identity of one accepted connection, unique per server instance.
pub type ConnectionId = u64;

/// Connection-scoped socket activity.
#[derive(Debug)]
pub enum ServerEvent {
    /// A peer connected. `writer` sends frames to it.
    Connected {
        /// Connection identity.
        id: ConnectionId,
        /// Peer address.
        peer: SocketAddr,
        /// Outbound frame handle for this connection.
        writer: WriterHandle,
    },
    /// Bytes arrived on a connection.
    Data {
        /// Connection identity.
        id: ConnectionId,
        /// Raw bytes, in arrival order.
        data: Bytes,
    },
    /// A connection ended (peer close, read error, or local close).
    Closed {
        /// Connection identity.
        id: ConnectionId,
    },
}

struct Connection {
    token: CancellationToken,
    writer_task: JoinHandle<Result<()>>,
}

struct Shared {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    shutdown: CancellationToken,
}

/// Cloneable control handle for a running [`SocketServer`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Close one connection.
    ///
    /// The reader stops and emits `Closed`; queued outbound frames are
    /// dropped. Returns `false` if the connection is unknown or already gone.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        let Some(conn) = self.connections().remove(&id) else {
            return false;
        };
        conn.token.cancel();
        conn.writer_task.abort();
        true
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    fn forget(&self, id: ConnectionId) {
        if let Some(conn) = self.connections().remove(&id) {
            conn.writer_task.abort();
        }
    }

    fn register(&self, id: ConnectionId, socket: TcpStream) -> (OwnedReadHalf, WriterHandle, CancellationToken) {
        let (read_half, write_half) = socket.into_split();
        let (writer, writer_task) = spawn_writer_task(write_half);
        let token = self.shared.shutdown.child_token();
        self.connections().insert(
            id,
            Connection {
                token: token.clone(),
                writer_task,
            },
        );
        (read_half, writer, token)
    }
}

/// Listening socket plus its accept loop.
///
/// Dropping the server stops it.
pub struct SocketServer {
    port: u16,
    handle: ServerHandle,
}

impl SocketServer {
    /// Bind an ephemeral localhost port and start accepting.
    ///
    /// Returns the server and the receiving end of its event stream.
    ///
    /// # Errors
    ///
    /// Returns `Bind` if the socket cannot be bound.
    pub async fn start() -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>)> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(SockwireError::Bind)?;
        let port = listener.local_addr().map_err(SockwireError::Bind)?.port();
        tracing::debug!(port, "socket server listening");

        let handle = ServerHandle {
            shared: Arc::new(Shared {
                connections: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(listener, events_tx, handle.clone()));

        Ok((Self { port, handle }, events_rx))
    }

    /// The OS-assigned port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// A cloneable control handle.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stop listening and close every connection.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        if self.handle.is_stopped() {
            return;
        }
        self.handle.shared.shutdown.cancel();
        for (_, conn) in self.handle.connections().drain() {
            conn.writer_task.abort();
        }
        tracing::debug!(port = self.port, "socket server stopped");
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<ServerEvent>,
    handle: ServerHandle,
) {
    let shutdown = handle.shared.shutdown.clone();
    let mut next_id: ConnectionId = 0;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok((socket, peer)) => {
                    next_id += 1;
                    let id = next_id;
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!(connection = id, error = %e, "set_nodelay failed");
                    }
                    tracing::debug!(connection = id, %peer, "worker connected");

                    let (read_half, writer, token) = handle.register(id, socket);
                    let _ = events.send(ServerEvent::Connected { id, peer, writer });
                    tokio::spawn(read_loop(id, read_half, events.clone(), token, handle.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<ServerEvent>,
    token: CancellationToken,
    handle: ServerHandle,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        buf.reserve(READ_BUFFER_SIZE);
        tokio::select! {
            () = token.cancelled() => break,
            res = reader.read_buf(&mut buf) => match res {
                Ok(0) => break,
                Ok(_) => {
                    let data = buf.split().freeze();
                    if events.send(ServerEvent::Data { id, data }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(connection = id, error = %e, "socket read failed");
                    break;
                }
            }
        }
    }

    handle.forget(id);
    tracing::debug!(connection = id, "connection closed");
    let _ = events.send(ServerEvent::Closed { id });
}
