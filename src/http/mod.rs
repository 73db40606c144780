//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TransportEvent::Received
//!     → server.rs (registry lookup, dispatch)
//!     → request.rs (reassemble and decode the request head)
//!     → [websocket server offered the request if it asks for an upgrade]
//!     → `request` / `upgrade` listeners
//!     → response.rs (status line, headers, chunked body)
//!     → Outbound commands to the transport
//! ```

pub mod headers;
pub mod registry;
pub mod request;
pub mod response;
pub mod server;

pub use headers::Headers;
pub use request::{DecodedRequest, Reassembler, RequestError, RequestHead};
pub use response::{HttpRequest, ResponseError};
pub use server::HttpServer;
