//! HTTP server: connection registry and event dispatch.
//!
//! # Responsibilities
//! - Own the connection registry (insert on accept, replace on upgrade,
//!   remove on close)
//! - Feed inbound bytes to request reassembly or to the WebSocket connection
//! - Raise `request` / `upgrade` for decoded requests
//! - Route write acknowledgements to the record holding the matching lease
//!
//! # Design Decisions
//! - Every transport event is processed to completion before the next one
//! - A request nobody handles is closed
//! - A keep-alive exchange returns the socket to request reassembly once it
//!   closes; any other exchange takes the socket down with it

use std::io;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::config::ServerConfig;
use crate::events::{self, EventSource, ListenerId};
use crate::http::registry::{Connection, HttpConnection, Registry};
use crate::http::request::{DecodedRequest, RequestError};
use crate::http::response::HttpRequest;
use crate::net::{Attachment, ConnectionState, Lease, Outbound, SocketId, TransportEvent};
use crate::observability::metrics;
use crate::websocket::server::UpgradeOutcome;
use crate::websocket::WebSocketServer;

/// Protocol core driving HTTP exchanges and WebSocket upgrades.
pub struct HttpServer {
    registry: Registry,
    outbound: Outbound,
    events: EventSource<HttpRequest>,
    websocket: WebSocketServer,
    max_header_bytes: usize,
    websocket_enabled: bool,
}

impl HttpServer {
    /// Create a server issuing transport commands through `outbound`.
    pub fn new(config: &ServerConfig, outbound: Outbound) -> Self {
        Self {
            registry: Registry::new(),
            outbound,
            events: EventSource::new(),
            websocket: WebSocketServer::new(config.websocket.clone()),
            max_header_bytes: config.http.max_header_bytes,
            websocket_enabled: config.websocket.enabled,
        }
    }

    /// Subscribe to `request` or `upgrade`.
    pub fn on<F>(&mut self, event: &'static str, handler: F) -> ListenerId
    where
        F: FnMut(&mut HttpRequest) -> bool + Send + 'static,
    {
        self.events.on(event, handler)
    }

    pub fn off(&mut self, event: &str, id: ListenerId) -> bool {
        self.events.off(event, id)
    }

    /// The WebSocket server upgrade requests are offered to.
    pub fn websocket_mut(&mut self) -> &mut WebSocketServer {
        &mut self.websocket
    }

    /// Number of registered sockets.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_registered(&self, socket: SocketId) -> bool {
        self.registry.contains(socket)
    }

    /// Run `f` on the exchange in flight on `socket`, e.g. to finish a
    /// response deferred by a handler.
    pub fn with_request<R>(
        &mut self,
        socket: SocketId,
        f: impl FnOnce(&mut HttpRequest) -> R,
    ) -> Option<R> {
        let Some(Connection::Http(conn)) = self.registry.get_mut(socket) else {
            return None;
        };
        let exchange = conn.exchange.as_mut()?;
        let result = f(exchange);
        self.reap(socket);
        metrics::record_active_connections(self.registry.len());
        Some(result)
    }

    /// Process one transport event.
    pub fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Accepted { socket, peer } => {
                self.registry.insert(
                    socket,
                    Connection::Http(HttpConnection::new(self.max_header_bytes)),
                );
                metrics::record_connection_accepted();
                tracing::debug!(socket = %socket, peer = %peer, "Connection accepted");
            }
            TransportEvent::Received { socket, data } => self.on_received(socket, data),
            TransportEvent::ReceiveError { socket, error } => {
                tracing::warn!(socket = %socket, error = %error, "Error reading from socket");
                metrics::record_transport_error("receive");
                self.drop_connection(socket);
            }
            TransportEvent::Disconnected { socket } => {
                tracing::debug!(socket = %socket, "Peer disconnected");
                self.drop_connection(socket);
            }
            TransportEvent::Sent {
                socket,
                lease,
                requested,
                result,
            } => self.on_sent(socket, lease, requested, result),
        }
        metrics::record_active_connections(self.registry.len());
    }

    /// Consume transport events until the channel closes or shutdown fires.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!("HTTP server loop started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!(
            open_connections = self.registry.len(),
            "HTTP server loop stopped"
        );
    }

    fn on_received(&mut self, socket: SocketId, data: Bytes) {
        let decoded = match self.registry.get_mut(socket) {
            None => {
                tracing::trace!(socket = %socket, "Bytes for unknown socket ignored");
                return;
            }
            Some(Connection::WebSocket(ws)) => {
                ws.receive(&data);
                if ws.state() == ConnectionState::Closed {
                    self.registry.remove(socket);
                }
                return;
            }
            Some(Connection::Http(conn)) => match conn.reassembler.push(&data) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return,
                Err(e) => {
                    self.reject_input(socket, &e);
                    return;
                }
            },
        };
        self.dispatch(socket, decoded);
        self.reap(socket);
    }

    fn reject_input(&mut self, socket: SocketId, error: &RequestError) {
        tracing::warn!(socket = %socket, error = %error, "Closing connection");
        self.outbound.close(socket);
        self.registry.remove(socket);
    }

    fn dispatch(&mut self, socket: SocketId, decoded: DecodedRequest) {
        let DecodedRequest { head, remainder } = decoded;
        let request = HttpRequest::new(head, Attachment::new(socket), self.outbound.clone());
        metrics::record_request(request.method());
        tracing::debug!(
            socket = %socket,
            method = ?request.method(),
            url = ?request.url(),
            keep_alive = request.is_keep_alive(),
            "Request decoded"
        );

        let is_upgrade = request.headers().contains("Upgrade");
        let mut request = if is_upgrade && self.websocket_enabled {
            match self.websocket.upgrade(request, remainder) {
                UpgradeOutcome::Accepted(connection) => {
                    if connection.state() == ConnectionState::Closed {
                        self.registry.remove(socket);
                    } else {
                        self.registry.insert(socket, Connection::WebSocket(connection));
                    }
                    return;
                }
                UpgradeOutcome::Rejected => {
                    self.registry.remove(socket);
                    return;
                }
                UpgradeOutcome::NotWebSocket(request) | UpgradeOutcome::Declined(request) => request,
            }
        } else {
            request
        };

        let event = if is_upgrade { events::UPGRADE } else { events::REQUEST };
        if !self.events.emit(event, &mut request) {
            tracing::debug!(socket = %socket, event, "Unhandled request, closing");
            metrics::record_unhandled_request(event);
            request.close();
        }

        if let Some(Connection::Http(conn)) = self.registry.get_mut(socket) {
            conn.exchange = Some(request);
        }
    }

    fn on_sent(&mut self, socket: SocketId, lease: Lease, requested: usize, result: io::Result<usize>) {
        let mut reap = false;
        let mut closed = false;
        match self.registry.get_mut(socket) {
            Some(Connection::Http(conn)) => match conn.exchange.as_mut() {
                Some(exchange) if exchange.lease() == Some(lease) => {
                    exchange.on_sent(result);
                    reap = true;
                }
                _ => tracing::trace!(socket = %socket, lease = %lease, "Stale write acknowledgement"),
            },
            Some(Connection::WebSocket(ws)) if ws.lease() == lease => {
                ws.on_sent(requested, result);
                closed = ws.state() == ConnectionState::Closed;
            }
            _ => tracing::trace!(socket = %socket, lease = %lease, "Stale write acknowledgement"),
        }

        if reap {
            self.reap(socket);
        }
        if closed {
            self.registry.remove(socket);
        }
    }

    /// Retire a closed exchange. On a kept-alive socket, requests that
    /// arrived meanwhile are dispatched in order.
    fn reap(&mut self, socket: SocketId) {
        loop {
            let Some(Connection::Http(conn)) = self.registry.get_mut(socket) else {
                return;
            };
            let Some(exchange) = conn.exchange.as_ref() else {
                return;
            };
            if exchange.state() != ConnectionState::Closed {
                return;
            }

            if exchange.transport_closed() {
                self.registry.remove(socket);
                tracing::debug!(socket = %socket, "Connection closed");
                return;
            }
            conn.exchange = None;
            conn.reassembler.reset();
            tracing::debug!(socket = %socket, "Keep-alive exchange finished");

            match conn.reassembler.next_request() {
                Ok(Some(decoded)) => self.dispatch(socket, decoded),
                Ok(None) => return,
                Err(e) => {
                    self.reject_input(socket, &e);
                    return;
                }
            }
        }
    }

    fn drop_connection(&mut self, socket: SocketId) {
        match self.registry.remove(socket) {
            Some(Connection::Http(_)) => self.outbound.close(socket),
            Some(Connection::WebSocket(mut ws)) => ws.fail(),
            None => {}
        }
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("connections", &self.registry.len())
            .field("events", &self.events)
            .field("websocket", &self.websocket)
            .finish()
    }
}
