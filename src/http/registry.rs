//! Per-socket connection records.
//!
//! A socket starts in the HTTP phase and may move to the WebSocket phase on
//! upgrade. A lookup miss means the socket was already closed.

use std::collections::HashMap;

use crate::http::request::Reassembler;
use crate::http::response::HttpRequest;
use crate::net::SocketId;
use crate::websocket::WebSocketConnection;

/// HTTP phase: request reassembly plus the exchange in flight, if any.
#[derive(Debug)]
pub struct HttpConnection {
    pub reassembler: Reassembler,
    pub exchange: Option<HttpRequest>,
}

impl HttpConnection {
    pub fn new(max_header_bytes: usize) -> Self {
        Self {
            reassembler: Reassembler::new(max_header_bytes),
            exchange: None,
        }
    }
}

#[derive(Debug)]
pub enum Connection {
    Http(HttpConnection),
    WebSocket(WebSocketConnection),
}

impl Connection {
    pub fn phase(&self) -> &'static str {
        match self {
            Connection::Http(_) => "http",
            Connection::WebSocket(_) => "websocket",
        }
    }
}

/// Socket id → connection record.
#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<SocketId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `socket`.
    pub fn insert(&mut self, socket: SocketId, connection: Connection) -> Option<Connection> {
        self.connections.insert(socket, connection)
    }

    pub fn get_mut(&mut self, socket: SocketId) -> Option<&mut Connection> {
        self.connections.get_mut(&socket)
    }

    pub fn remove(&mut self, socket: SocketId) -> Option<Connection> {
        self.connections.remove(&socket)
    }

    pub fn contains(&self, socket: SocketId) -> bool {
        self.connections.contains_key(&socket)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replace_remove() {
        let mut registry = Registry::new();
        let socket = SocketId::next();
        assert!(registry.insert(socket, Connection::Http(HttpConnection::new(64))).is_none());
        assert!(registry.contains(socket));

        let previous = registry.insert(socket, Connection::Http(HttpConnection::new(64)));
        assert_eq!(previous.map(|c| c.phase()), Some("http"));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(socket).is_some());
        assert!(registry.remove(socket).is_none());
        assert!(registry.get_mut(socket).is_none());
        assert!(registry.is_empty());
    }
}
