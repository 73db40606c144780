//! Socket identity, ownership leases and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique socket IDs for the registry and for tracing
//! - Mint leases so outbound writes can be tied to the record that issued them
//! - Track connection state (Open → Closing → Closed)
//! - Count live sockets for graceful shutdown

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Global atomic counter for socket IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static SOCKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Global atomic counter for leases.
static LEASE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

impl SocketId {
    /// Mint the next unique socket ID.
    pub fn next() -> Self {
        Self(SOCKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Ownership token for a socket.
///
/// A new lease is minted each time a record takes over a socket (an HTTP
/// exchange, then possibly a WebSocket connection). Write acknowledgements
/// carry the lease of the writer; an acknowledgement whose lease does not
/// match the current owner belongs to a record that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease(u64);

impl Lease {
    /// Mint a fresh lease.
    pub fn next() -> Self {
        Self(LEASE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// The association between a record and the socket it currently owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub socket: SocketId,
    pub lease: Lease,
}

impl Attachment {
    /// Attach to `socket` under a fresh lease.
    pub fn new(socket: SocketId) -> Self {
        Self {
            socket,
            lease: Lease::next(),
        }
    }

    /// Move ownership of the same socket to a new record.
    pub fn transfer(self) -> Self {
        Self::new(self.socket)
    }
}

/// Ready state shared by HTTP exchanges and WebSocket connections.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Exchanging data.
    Open = 0,
    /// Close initiated, waiting for in-flight data or the peer's confirmation.
    Closing = 1,
    /// Terminal.
    Closed = 2,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Tracks live sockets for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    /// Current count of live sockets.
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new live socket. Returns a guard that decrements on drop.
    pub fn track(&self, socket: SocketId) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            socket,
        }
    }

    /// Get current live socket count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until every tracked socket has been released.
    pub async fn wait_for_drain(&self) {
        while self.active_count.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }
    }
}

/// Guard that tracks a socket's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    socket: SocketId,
}

impl ConnectionGuard {
    /// Get the tracked socket's ID.
    pub fn socket(&self) -> SocketId {
        self.socket
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(socket = %self.socket, "Socket released");
    }
}
