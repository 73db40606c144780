//! Built-in runtime that describes itself and reports unknown commands.

use serde_json::{json, Value};

use crate::config::RuntimeConfig;
use crate::runtime::{Context, Runtime};

/// Answers `runtime/getruntime`; every other command gets an `error` reply.
#[derive(Debug, Clone)]
pub struct BasicRuntime {
    config: RuntimeConfig,
}

impl BasicRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Payload of the `runtime/runtime` reply.
    pub fn description(&self) -> Value {
        json!({
            "type": self.config.runtime_type,
            "version": self.config.protocol_version,
            "capabilities": self.config.capabilities,
            "label": self.config.label,
        })
    }
}

impl Runtime for BasicRuntime {
    fn receive(&mut self, protocol: &str, command: &str, _payload: Value, context: &Context) {
        match (protocol, command) {
            ("runtime", "getruntime") => {
                context.send("runtime", "runtime", self.description());
            }
            _ => {
                tracing::debug!(protocol, command, "Unsupported runtime command");
                context.send(
                    protocol,
                    "error",
                    json!({ "message": format!("Unsupported command {protocol}:{command}") }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebSocketConfig;
    use crate::http::response::tests::request;
    use crate::runtime::{Envelope, RuntimeServer};
    use crate::websocket::connection::tests::{client_frame, server_frames};
    use crate::websocket::frame::Frame;
    use crate::websocket::server::UpgradeOutcome;
    use crate::websocket::WebSocketServer;
    use bytes::Bytes;

    fn ask(message: &str) -> Envelope {
        let mut server = WebSocketServer::new(WebSocketConfig::default());
        RuntimeServer::attach(&mut server, BasicRuntime::new(RuntimeConfig::default()));
        let (http, mut rx) =
            request(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: a2V5\r\n\r\n");
        let UpgradeOutcome::Accepted(mut connection) = server.upgrade(http, Bytes::new()) else {
            panic!("not accepted");
        };
        while rx.try_recv().is_ok() {}

        connection.receive(&client_frame(Frame::text(message)));
        let mut commands = Vec::new();
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        let frames = server_frames(&commands);
        assert_eq!(frames.len(), 1);
        serde_json::from_slice(&frames[0].payload).unwrap()
    }

    #[test]
    fn describes_itself() {
        let reply = ask(r#"{"protocol":"runtime","command":"getruntime","payload":{}}"#);
        assert_eq!(reply.protocol, "runtime");
        assert_eq!(reply.command, "runtime");
        assert_eq!(reply.payload["type"], "socket-runtime");
        assert_eq!(reply.payload["capabilities"][0], "protocol:runtime");
        assert_eq!(reply.payload["label"], "Socket runtime");
    }

    #[test]
    fn unknown_command_is_an_error_on_same_protocol() {
        let reply = ask(r#"{"protocol":"graph","command":"clear"}"#);
        assert_eq!(reply.protocol, "graph");
        assert_eq!(reply.command, "error");
        assert_eq!(reply.payload["message"], "Unsupported command graph:clear");
    }
}
