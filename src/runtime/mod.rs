//! Message runtime served over WebSocket.
//!
//! # Responsibilities
//! - Accept every WebSocket upgrade and track open connections
//! - Decode `{"protocol", "command", "payload"}` text messages
//! - Route decoded envelopes to a [`Runtime`] implementation
//! - Encode replies and broadcasts in the same envelope shape
//!
//! # Design Decisions
//! - Binary and unparsable messages are ignored
//! - Replies to a connection that is no longer open are dropped

pub mod basic;

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events;
use crate::websocket::{Message, WebSocketConnection, WebSocketHandle, WebSocketServer};

pub use basic::BasicRuntime;

/// Wire shape of every runtime message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol: String,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

/// The connection a message arrived on.
#[derive(Debug, Clone)]
pub struct Context {
    pub connection: WebSocketHandle,
}

impl Context {
    /// Send an envelope back. Returns whether it was written.
    pub fn send(&self, protocol: &str, command: &str, payload: Value) -> bool {
        send_envelope(&self.connection, protocol, command, payload)
    }
}

/// Application layer consuming runtime envelopes.
pub trait Runtime: Send + 'static {
    fn receive(&mut self, protocol: &str, command: &str, payload: Value, context: &Context);
}

/// Attaches a [`Runtime`] to a WebSocket server.
pub struct RuntimeServer<R> {
    runtime: Arc<Mutex<R>>,
    connections: Arc<Mutex<Vec<WebSocketHandle>>>,
}

impl<R> Clone for RuntimeServer<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            connections: Arc::clone(&self.connections),
        }
    }
}

impl<R: Runtime> RuntimeServer<R> {
    /// Accept every upgrade offered to `server` into `runtime`.
    pub fn attach(server: &mut WebSocketServer, runtime: R) -> Self {
        let this = Self {
            runtime: Arc::new(Mutex::new(runtime)),
            connections: Arc::new(Mutex::new(Vec::new())),
        };
        let runtime_server = this.clone();
        server.on(events::REQUEST, move |request| match request.accept() {
            Ok(connection) => {
                runtime_server.track(connection);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Runtime could not accept upgrade");
                false
            }
        });
        this
    }

    /// Number of open runtime connections.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Send an envelope to every open connection. Returns how many were written.
    pub fn broadcast(&self, protocol: &str, command: &str, payload: Value) -> usize {
        let connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        connections
            .iter()
            .filter(|connection| send_envelope(connection, protocol, command, payload.clone()))
            .count()
    }

    /// Run `f` with the runtime locked.
    pub fn with_runtime<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut runtime)
    }

    fn track(&self, connection: &mut WebSocketConnection) {
        let handle = connection.handle();
        let socket = handle.socket();
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());
        tracing::debug!(socket = %socket, "Runtime connection opened");

        let runtime = Arc::clone(&self.runtime);
        let context = Context { connection: handle };
        connection.on_message(move |message| {
            let Message::Text(text) = message else {
                return false;
            };
            let envelope: Envelope = match serde_json::from_str(text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(socket = %socket, error = %e, "Ignoring malformed runtime message");
                    return false;
                }
            };
            tracing::debug!(
                socket = %socket,
                protocol = %envelope.protocol,
                command = %envelope.command,
                "Runtime message"
            );
            runtime
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .receive(&envelope.protocol, &envelope.command, envelope.payload, &context);
            true
        });

        let connections = Arc::clone(&self.connections);
        connection.on_close(move || {
            connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|c| c.socket() != socket);
            tracing::debug!(socket = %socket, "Runtime connection closed");
            false
        });
    }
}

fn send_envelope(connection: &WebSocketHandle, protocol: &str, command: &str, payload: Value) -> bool {
    if !connection.is_open() {
        return false;
    }
    let envelope = Envelope {
        protocol: protocol.to_owned(),
        command: command.to_owned(),
        payload,
    };
    let text = match serde_json::to_string(&envelope) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode runtime message");
            return false;
        }
    };
    connection.send(&text).is_ok()
}
