//! WebSocket subsystem.
//!
//! # Data Flow
//! ```text
//! HttpRequest with `Upgrade: websocket`
//!     → handshake.rs (validate, derive accept key)
//!     → server.rs (offer to `request` listeners, accept or reject)
//!     → connection.rs (registry-owned state machine)
//!     → frame.rs (RFC 6455 decode/encode)
//! ```
//!
//! Connection States:
//!     Open → Closing → Closed

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod server;

pub use connection::{Message, WebSocketConnection, WebSocketError, WebSocketEvent, WebSocketHandle};
pub use handshake::HandshakeError;
pub use server::{WebSocketRequest, WebSocketServer};
