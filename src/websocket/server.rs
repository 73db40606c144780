//! WebSocket upgrade dispatch.
//!
//! # Responsibilities
//! - Offer valid upgrade requests to `request` listeners
//! - Turn an accepted request into a registry-owned connection
//! - Hand declined requests back to ordinary HTTP handling

use bytes::Bytes;

use crate::config::WebSocketConfig;
use crate::events::{self, EventSource, ListenerId};
use crate::http::headers::Headers;
use crate::http::response::HttpRequest;
use crate::net::ConnectionState;
use crate::observability::metrics;
use crate::websocket::connection::WebSocketConnection;
use crate::websocket::handshake::{self, HandshakeError};

/// An upgrade request awaiting a decision.
#[derive(Debug)]
pub struct WebSocketRequest {
    http: HttpRequest,
    config: WebSocketConfig,
    accepted: Option<WebSocketConnection>,
}

impl WebSocketRequest {
    fn new(http: HttpRequest, config: WebSocketConfig) -> Self {
        Self {
            http,
            config,
            accepted: None,
        }
    }

    pub fn headers(&self) -> &Headers {
        self.http.headers()
    }

    pub fn url(&self) -> Option<&str> {
        self.http.url()
    }

    pub fn key(&self) -> Option<&str> {
        self.headers().get("Sec-WebSocket-Key")
    }

    pub fn origin(&self) -> Option<&str> {
        self.headers().get("Origin")
    }

    /// First subprotocol the client offered.
    pub fn protocol(&self) -> Option<&str> {
        handshake::first_protocol(self.headers())
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.is_some()
    }

    /// Complete the handshake and take over the socket.
    ///
    /// The returned connection is where `message` and `close` handlers are
    /// registered; it is moved into the registry once the listener returns.
    pub fn accept(&mut self) -> Result<&mut WebSocketConnection, HandshakeError> {
        if self.accepted.is_some() {
            return Err(HandshakeError::AlreadyAccepted);
        }
        if self.http.state() != ConnectionState::Open {
            return Err(HandshakeError::Closed);
        }
        let key = self.key().ok_or(HandshakeError::MissingKey)?;
        let headers = handshake::response_headers(key, self.protocol());

        self.http.write_head(101, headers)?;
        let Some(attachment) = self.http.detach() else {
            return Err(HandshakeError::Closed);
        };
        self.http.close();

        let connection =
            WebSocketConnection::new(attachment.transfer(), self.http.outbound().clone(), &self.config);
        tracing::info!(
            socket = %connection.socket(),
            url = ?self.url(),
            protocol = ?self.protocol(),
            "WebSocket upgrade accepted"
        );
        Ok(self.accepted.insert(connection))
    }

    /// Refuse the upgrade and close the socket.
    pub fn reject(&mut self) {
        if self.accepted.is_some() {
            return;
        }
        tracing::info!(socket = ?self.http.socket(), url = ?self.url(), "WebSocket upgrade rejected");
        self.http.abort();
    }
}

/// Result of offering a request to the WebSocket server.
#[derive(Debug)]
pub(crate) enum UpgradeOutcome {
    /// Not a websocket upgrade; handle as plain HTTP.
    NotWebSocket(HttpRequest),
    /// No listener wanted it; handle as plain HTTP.
    Declined(HttpRequest),
    /// The socket was closed without upgrading.
    Rejected,
    /// The socket now belongs to this connection.
    Accepted(WebSocketConnection),
}

/// Dispatches upgrade requests to `request` listeners.
#[derive(Debug)]
pub struct WebSocketServer {
    events: EventSource<WebSocketRequest>,
    config: WebSocketConfig,
}

impl WebSocketServer {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            events: EventSource::new(),
            config,
        }
    }

    /// Subscribe to upgrade requests (`request`).
    pub fn on<F>(&mut self, event: &'static str, handler: F) -> ListenerId
    where
        F: FnMut(&mut WebSocketRequest) -> bool + Send + 'static,
    {
        self.events.on(event, handler)
    }

    pub fn off(&mut self, event: &str, id: ListenerId) -> bool {
        self.events.off(event, id)
    }

    /// Offer `http` for upgrade. `remainder` holds bytes that followed the
    /// request head and become the start of an accepted connection's input.
    pub(crate) fn upgrade(&mut self, http: HttpRequest, remainder: Bytes) -> UpgradeOutcome {
        if let Err(e) = handshake::validate(http.head()) {
            tracing::debug!(socket = ?http.socket(), reason = %e, "Not a websocket upgrade");
            return UpgradeOutcome::NotWebSocket(http);
        }

        let mut request = WebSocketRequest::new(http, self.config.clone());
        let claimed = self.events.emit(events::REQUEST, &mut request);
        let WebSocketRequest { mut http, accepted, .. } = request;

        match accepted {
            Some(mut connection) => {
                metrics::record_upgrade("accepted");
                if !remainder.is_empty() {
                    connection.receive(&remainder);
                }
                UpgradeOutcome::Accepted(connection)
            }
            None if http.state() == ConnectionState::Closed => {
                metrics::record_upgrade("rejected");
                UpgradeOutcome::Rejected
            }
            None if claimed => {
                tracing::info!(socket = ?http.socket(), "Upgrade claimed but not accepted, rejecting");
                metrics::record_upgrade("rejected");
                http.abort();
                UpgradeOutcome::Rejected
            }
            None => {
                metrics::record_upgrade("declined");
                UpgradeOutcome::Declined(http)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::tests::request;
    use crate::net::TransportCommand;
    use crate::websocket::connection::tests::{client_frame, server_frames};
    use crate::websocket::connection::Message;
    use crate::websocket::frame::Frame;
    use std::sync::{Arc, Mutex};

    const UPGRADE: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Protocol: noflo, chat\r\n\r\n";

    fn sent_text(commands: &[TransportCommand]) -> String {
        let bytes: Vec<u8> = commands
            .iter()
            .filter_map(|c| match c {
                TransportCommand::Send { data, .. } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<TransportCommand>) -> Vec<TransportCommand> {
        let mut out = Vec::new();
        while let Ok(command) = rx.try_recv() {
            out.push(command);
        }
        out
    }

    #[test]
    fn accept_writes_switching_protocols() {
        let (http, mut rx) = request(UPGRADE);
        let socket = http.socket().unwrap();
        let mut server = WebSocketServer::new(WebSocketConfig::default());
        server.on(events::REQUEST, |req| {
            assert_eq!(req.protocol(), Some("noflo"));
            req.accept().is_ok()
        });

        let UpgradeOutcome::Accepted(connection) = server.upgrade(http, Bytes::new()) else {
            panic!("upgrade not accepted");
        };
        assert_eq!(connection.socket(), socket);
        assert_eq!(connection.state(), ConnectionState::Open);

        let commands = drain(&mut rx);
        let text = sent_text(&commands);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: noflo\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
        // The socket stays open for the new owner.
        assert!(!commands.iter().any(|c| matches!(c, TransportCommand::Close { .. })));

        // The connection writes under its own lease.
        let TransportCommand::Send { lease, .. } = &commands[0] else {
            panic!("expected the handshake write");
        };
        assert_ne!(*lease, connection.lease());
    }

    #[test]
    fn remainder_seeds_the_connection() {
        let (http, _rx) = request(UPGRADE);
        let received = Arc::new(Mutex::new(Vec::new()));
        let mut server = WebSocketServer::new(WebSocketConfig::default());
        let sink = received.clone();
        server.on(events::REQUEST, move |req| {
            let sink = sink.clone();
            match req.accept() {
                Ok(connection) => {
                    connection.on_message(move |m| {
                        sink.lock().unwrap().push(m.clone());
                        true
                    });
                    true
                }
                Err(_) => false,
            }
        });

        let remainder = Bytes::from(client_frame(Frame::text("early")));
        assert!(matches!(server.upgrade(http, remainder), UpgradeOutcome::Accepted(_)));
        assert_eq!(*received.lock().unwrap(), vec![Message::Text("early".into())]);
    }

    #[test]
    fn second_accept_fails() {
        let (http, _rx) = request(UPGRADE);
        let mut server = WebSocketServer::new(WebSocketConfig::default());
        server.on(events::REQUEST, |req| {
            assert!(req.accept().is_ok());
            assert!(matches!(req.accept(), Err(HandshakeError::AlreadyAccepted)));
            true
        });
        assert!(matches!(server.upgrade(http, Bytes::new()), UpgradeOutcome::Accepted(_)));
    }

    #[test]
    fn reject_closes_socket() {
        let (http, mut rx) = request(UPGRADE);
        let mut server = WebSocketServer::new(WebSocketConfig::default());
        server.on(events::REQUEST, |req| {
            req.reject();
            true
        });
        assert!(matches!(server.upgrade(http, Bytes::new()), UpgradeOutcome::Rejected));
        assert!(matches!(drain(&mut rx).as_slice(), [TransportCommand::Close { .. }]));
    }

    #[test]
    fn claimed_but_undecided_is_rejected() {
        let (http, mut rx) = request(UPGRADE);
        let mut server = WebSocketServer::new(WebSocketConfig::default());
        server.on(events::REQUEST, |_| true);
        assert!(matches!(server.upgrade(http, Bytes::new()), UpgradeOutcome::Rejected));
        assert!(matches!(drain(&mut rx).as_slice(), [TransportCommand::Close { .. }]));
    }

    #[test]
    fn unclaimed_is_declined_with_socket_intact() {
        let (http, mut rx) = request(UPGRADE);
        let socket = http.socket();
        let mut server = WebSocketServer::new(WebSocketConfig::default());
        server.on(events::REQUEST, |_| false);

        let UpgradeOutcome::Declined(http) = server.upgrade(http, Bytes::new()) else {
            panic!("expected decline");
        };
        assert_eq!(http.socket(), socket);
        assert_eq!(http.state(), ConnectionState::Open);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn non_websocket_upgrade_is_passed_through() {
        let (http, _rx) = request(b"GET / HTTP/1.1\r\nUpgrade: h2c\r\n\r\n");
        let mut server = WebSocketServer::new(WebSocketConfig::default());
        server.on(events::REQUEST, |_| panic!("must not be offered"));
        assert!(matches!(
            server.upgrade(http, Bytes::new()),
            UpgradeOutcome::NotWebSocket(_)
        ));
    }

    #[test]
    fn accepted_connection_answers_frames() {
        let (http, mut rx) = request(UPGRADE);
        let mut server = WebSocketServer::new(WebSocketConfig::default());
        server.on(events::REQUEST, |req| req.accept().is_ok());
        let UpgradeOutcome::Accepted(mut connection) = server.upgrade(http, Bytes::new()) else {
            panic!("upgrade not accepted");
        };
        drain(&mut rx);

        connection.handle().send("hi").unwrap();
        let frames = server_frames(&drain(&mut rx));
        assert_eq!(frames, vec![Frame::text("hi")]);

        connection.receive(&client_frame(Frame::close(None)));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
