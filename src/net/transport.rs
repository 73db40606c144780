//! Transport interface and the Tokio TCP implementation.
//!
//! # Responsibilities
//! - Define the events the protocol core consumes and the commands it issues
//! - Run the accept loop and one reader/writer task pair per socket
//! - Acknowledge every write with the number of bytes sent or the error
//!
//! # Data Flow
//! ```text
//! socket reads  → reader task → TransportEvent ──▶ server loop
//! server loop   → Outbound    → TransportCommand ─▶ transport loop → writer task
//! writer task   → TransportEvent::Sent ──────────▶ server loop
//! ```
//!
//! # Design Decisions
//! - Per-socket writes are executed in order, so a close queued after a send
//!   never truncates it
//! - Commands for unknown sockets are dropped silently (already closed)

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::net::connection::{ConnectionGuard, ConnectionTracker, Lease, SocketId};
use crate::net::listener::{ConnectionPermit, Listener};

const READ_CHUNK: usize = 8 * 1024;

/// Something that happened on a socket.
#[derive(Debug)]
pub enum TransportEvent {
    /// A new socket was accepted.
    Accepted { socket: SocketId, peer: SocketAddr },
    /// Bytes arrived.
    Received { socket: SocketId, data: Bytes },
    /// Reading failed.
    ReceiveError { socket: SocketId, error: io::Error },
    /// The peer closed its side of the connection.
    Disconnected { socket: SocketId },
    /// A previously queued write finished.
    Sent {
        socket: SocketId,
        lease: Lease,
        requested: usize,
        result: io::Result<usize>,
    },
}

/// Something the core wants done to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Write `data`; the acknowledgement carries `lease`.
    Send {
        socket: SocketId,
        lease: Lease,
        data: Bytes,
    },
    /// Shut down the write half.
    Disconnect { socket: SocketId },
    /// Release the socket.
    Close { socket: SocketId },
}

/// Cloneable handle used by the protocol core to issue transport commands.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl Outbound {
    /// Create a handle and the receiving end the transport consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue `data` for `socket`.
    pub fn send(&self, socket: SocketId, lease: Lease, data: Bytes) {
        self.dispatch(TransportCommand::Send { socket, lease, data });
    }

    /// Shut down the write half of `socket`.
    pub fn disconnect(&self, socket: SocketId) {
        self.dispatch(TransportCommand::Disconnect { socket });
    }

    /// Close `socket`.
    pub fn close(&self, socket: SocketId) {
        self.dispatch(TransportCommand::Close { socket });
    }

    fn dispatch(&self, command: TransportCommand) {
        if self.tx.send(command).is_err() {
            tracing::trace!("Transport gone, command dropped");
        }
    }
}

enum WriteOp {
    Send { lease: Lease, data: Bytes },
    Shutdown,
}

struct SocketTask {
    writer: mpsc::UnboundedSender<WriteOp>,
    reader: JoinHandle<()>,
}

/// TCP transport driving accepted sockets on Tokio.
pub struct TcpTransport {
    listener: Listener,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    sockets: HashMap<SocketId, SocketTask>,
    tracker: ConnectionTracker,
}

impl TcpTransport {
    /// Create a transport that reports to `events` and obeys `commands`.
    pub fn new(
        listener: Listener,
        events: mpsc::UnboundedSender<TransportEvent>,
        commands: mpsc::UnboundedReceiver<TransportCommand>,
    ) -> Self {
        Self {
            listener,
            events,
            commands,
            sockets: HashMap::new(),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Tracker counting live sockets.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections and execute commands until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => self.register(stream, peer, permit),
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.execute(command),
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!(open_sockets = self.sockets.len(), "Transport stopping");
        for (_, task) in self.sockets.drain() {
            task.reader.abort();
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        let socket = SocketId::next();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(socket = %socket, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        // The core must learn about the socket before any bytes from it.
        if self
            .events
            .send(TransportEvent::Accepted { socket, peer })
            .is_err()
        {
            return;
        }

        let guard = self.tracker.track(socket);
        let reader = tokio::spawn(read_loop(socket, read_half, self.events.clone()));
        tokio::spawn(write_loop(
            socket,
            write_half,
            writer_rx,
            self.events.clone(),
            guard,
            permit,
        ));

        self.sockets.insert(
            socket,
            SocketTask {
                writer: writer_tx,
                reader,
            },
        );
        tracing::debug!(socket = %socket, peer = %peer, "Socket registered");
    }

    fn execute(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Send { socket, lease, data } => {
                if let Some(task) = self.sockets.get(&socket) {
                    let _ = task.writer.send(WriteOp::Send { lease, data });
                } else {
                    tracing::trace!(socket = %socket, "Send to unknown socket dropped");
                }
            }
            TransportCommand::Disconnect { socket } => {
                if let Some(task) = self.sockets.get(&socket) {
                    let _ = task.writer.send(WriteOp::Shutdown);
                }
            }
            TransportCommand::Close { socket } => {
                // Dropping the writer sender lets the write loop drain queued
                // writes and then release the socket.
                if let Some(task) = self.sockets.remove(&socket) {
                    task.reader.abort();
                    tracing::debug!(socket = %socket, "Socket closed");
                }
            }
        }
    }
}

async fn read_loop(
    socket: SocketId,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events.send(TransportEvent::Disconnected { socket });
                break;
            }
            Ok(_) => {
                let data = buf.split().freeze();
                if events.send(TransportEvent::Received { socket, data }).is_err() {
                    break;
                }
            }
            Err(error) => {
                let _ = events.send(TransportEvent::ReceiveError { socket, error });
                break;
            }
        }
    }
}

async fn write_loop(
    socket: SocketId,
    mut writer: OwnedWriteHalf,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    events: mpsc::UnboundedSender<TransportEvent>,
    _guard: ConnectionGuard,
    _permit: ConnectionPermit,
) {
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Send { lease, data } => {
                let requested = data.len();
                let result = writer.write_all(&data).await.map(|()| requested);
                let failed = result.is_err();
                let _ = events.send(TransportEvent::Sent {
                    socket,
                    lease,
                    requested,
                    result,
                });
                if failed {
                    break;
                }
            }
            WriteOp::Shutdown => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(socket = %socket, error = %e, "Shutdown failed");
                }
            }
        }
    }
}
