//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → transport.rs (reader/writer tasks, events and commands)
//!     → connection.rs (socket IDs, leases, lifecycle tracking)
//!     → Hand off to the HTTP layer as TransportEvents
//!
//! Connection States:
//!     Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - The protocol core never touches sockets; it consumes events and issues
//!   commands, so it can be driven by tests without a network

pub mod connection;
pub mod listener;
pub mod transport;

pub use connection::{Attachment, ConnectionState, Lease, SocketId};
pub use transport::{Outbound, TransportCommand, TransportEvent};
