//! HTTP/1.1 and WebSocket server core with a JSON message runtime.

pub mod config;
pub mod events;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod runtime;
pub mod websocket;

pub use config::ServerConfig;
pub use http::{HttpRequest, HttpServer};
pub use lifecycle::{launch, Launched, Shutdown};
pub use websocket::{WebSocketConnection, WebSocketHandle, WebSocketServer};
