//! WebSocket connection state machine.
//!
//! # Responsibilities
//! - Decode inbound frames and reassemble fragmented messages
//! - Run the close handshake (Open → Closing → Closed)
//! - Answer PING with PONG and protocol violations with a CLOSE status
//! - Raise `message` and exactly one `close` event per connection
//!
//! # Design Decisions
//! - The registry owns the connection; the application talks to it through
//!   cloneable [`WebSocketHandle`]s that share its ready state
//! - A short or failed write closes the connection without a CLOSE frame

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::config::WebSocketConfig;
use crate::events::{self, EventSource, ListenerId};
use crate::net::{Attachment, ConnectionState, Lease, Outbound, SocketId};
use crate::observability::metrics;
use crate::websocket::frame::{
    Codec, Frame, FrameError, OpCode, Role, CLOSE_INVALID_DATA, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR, CLOSE_TOO_BIG,
};

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::Text(_) => "text",
            Message::Binary(_) => "binary",
        }
    }
}

/// Argument passed to connection event handlers.
#[derive(Debug)]
pub enum WebSocketEvent {
    Message(Message),
    Close,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebSocketError {
    #[error("connection is {0:?}, not open")]
    NotOpen(ConnectionState),
}

/// Cloneable sending side of a connection.
#[derive(Debug, Clone)]
pub struct WebSocketHandle {
    attachment: Attachment,
    state: Arc<AtomicU8>,
    outbound: Outbound,
}

impl WebSocketHandle {
    /// Send a TEXT message.
    pub fn send(&self, text: &str) -> Result<(), WebSocketError> {
        self.send_message(Frame::text(text), "text")
    }

    /// Send a BINARY message.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), WebSocketError> {
        self.send_message(Frame::binary(data), "binary")
    }

    /// Start the close handshake.
    pub fn close(&self) -> Result<(), WebSocketError> {
        self.state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|current| WebSocketError::NotOpen(current.into()))?;
        tracing::debug!(socket = %self.attachment.socket, "Close handshake started");
        self.write_frame(&Frame::close(Some(CLOSE_NORMAL)));
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn socket(&self) -> SocketId {
        self.attachment.socket
    }

    fn send_message(&self, frame: Frame, kind: &'static str) -> Result<(), WebSocketError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(WebSocketError::NotOpen(state));
        }
        metrics::record_message("outbound", kind);
        self.write_frame(&frame);
        Ok(())
    }

    fn write_frame(&self, frame: &Frame) {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut buf);
        metrics::record_bytes_sent("websocket", buf.len());
        self.outbound
            .send(self.attachment.socket, self.attachment.lease, buf.freeze());
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// A WebSocket connection owned by the connection registry.
pub struct WebSocketConnection {
    handle: WebSocketHandle,
    codec: Codec,
    inbound: BytesMut,
    fragment: Option<(OpCode, BytesMut)>,
    events: EventSource<WebSocketEvent>,
    max_message_size: usize,
    auto_pong: bool,
}

impl WebSocketConnection {
    pub(crate) fn new(attachment: Attachment, outbound: Outbound, config: &WebSocketConfig) -> Self {
        Self {
            handle: WebSocketHandle {
                attachment,
                state: Arc::new(AtomicU8::new(ConnectionState::Open as u8)),
                outbound,
            },
            codec: Codec::new(Role::Server, config.max_message_size),
            inbound: BytesMut::new(),
            fragment: None,
            events: EventSource::new(),
            max_message_size: config.max_message_size,
            auto_pong: config.auto_pong,
        }
    }

    /// A sending handle sharing this connection's state.
    pub fn handle(&self) -> WebSocketHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn socket(&self) -> SocketId {
        self.handle.socket()
    }

    pub(crate) fn lease(&self) -> Lease {
        self.handle.attachment.lease
    }

    /// Subscribe to `message` or `close`.
    pub fn on<F>(&mut self, event: &'static str, handler: F) -> ListenerId
    where
        F: FnMut(&mut WebSocketEvent) -> bool + Send + 'static,
    {
        self.events.on(event, handler)
    }

    pub fn off(&mut self, event: &str, id: ListenerId) -> bool {
        self.events.off(event, id)
    }

    /// Subscribe to complete messages.
    pub fn on_message<F>(&mut self, mut handler: F) -> ListenerId
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        self.events.on(events::MESSAGE, move |event| match event {
            WebSocketEvent::Message(message) => handler(&*message),
            WebSocketEvent::Close => false,
        })
    }

    /// Subscribe to the end of the connection.
    pub fn on_close<F>(&mut self, mut handler: F) -> ListenerId
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.events.on(events::CLOSE, move |_| handler())
    }

    /// Feed bytes read from the socket.
    pub fn receive(&mut self, data: &[u8]) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.inbound.extend_from_slice(data);

        while self.state() != ConnectionState::Closed {
            match self.codec.decode(&mut self.inbound) {
                Ok(Some(frame)) => self.on_frame(frame),
                Ok(None) => break,
                Err(e) => {
                    self.protocol_error(e.close_code(), &e);
                    break;
                }
            }
        }
    }

    /// Transport acknowledgement for a frame this connection sent.
    pub(crate) fn on_sent(&mut self, requested: usize, result: io::Result<usize>) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        match result {
            Ok(sent) if sent == requested => {}
            Ok(sent) => {
                tracing::warn!(socket = %self.socket(), requested, sent, "Short websocket write");
                metrics::record_transport_error("send");
                self.finish();
            }
            Err(e) => {
                tracing::warn!(socket = %self.socket(), error = %e, "Error writing websocket frame");
                metrics::record_transport_error("send");
                self.finish();
            }
        }
    }

    /// The transport failed or the peer went away.
    pub(crate) fn fail(&mut self) {
        self.finish();
    }

    fn on_frame(&mut self, frame: Frame) {
        tracing::trace!(
            socket = %self.socket(),
            opcode = ?frame.opcode,
            fin = frame.fin,
            len = frame.payload.len(),
            "Frame received"
        );
        match frame.opcode {
            OpCode::Close => self.on_close_frame(frame),
            OpCode::Ping => {
                if self.auto_pong && self.state() == ConnectionState::Open {
                    self.handle.write_frame(&Frame::pong(frame.payload));
                }
            }
            OpCode::Pong => {}
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    self.protocol_error(CLOSE_PROTOCOL_ERROR, &"data frame inside a fragmented message");
                } else if frame.fin {
                    self.dispatch(frame.opcode, frame.payload);
                } else {
                    self.fragment = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
            }
            OpCode::Continuation => {
                let Some((opcode, mut buffer)) = self.fragment.take() else {
                    self.protocol_error(CLOSE_PROTOCOL_ERROR, &"continuation without a message");
                    return;
                };
                if buffer.len() + frame.payload.len() > self.max_message_size {
                    let error = FrameError::PayloadTooLarge {
                        len: (buffer.len() + frame.payload.len()) as u64,
                        max: self.max_message_size,
                    };
                    self.protocol_error(CLOSE_TOO_BIG, &error);
                    return;
                }
                buffer.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.dispatch(opcode, buffer.freeze());
                } else {
                    self.fragment = Some((opcode, buffer));
                }
            }
        }
    }

    fn on_close_frame(&mut self, frame: Frame) {
        match self.state() {
            ConnectionState::Open => {
                // A close payload is empty or starts with a two-byte code.
                if frame.payload.len() == 1 {
                    self.protocol_error(CLOSE_PROTOCOL_ERROR, &"close frame with a 1-byte payload");
                    return;
                }
                tracing::debug!(socket = %self.socket(), code = ?frame.close_code(), "Peer started close handshake");
                // Echo the status code only.
                let reply = Frame::new(true, OpCode::Close, frame.payload.slice(..frame.payload.len().min(2)));
                self.handle.set_state(ConnectionState::Closing);
                self.handle.write_frame(&reply);
                self.finish();
            }
            ConnectionState::Closing => {
                tracing::debug!(socket = %self.socket(), "Peer confirmed close");
                self.finish();
            }
            ConnectionState::Closed => {}
        }
    }

    fn dispatch(&mut self, opcode: OpCode, payload: Bytes) {
        let message = match opcode {
            OpCode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    self.protocol_error(CLOSE_INVALID_DATA, &e);
                    return;
                }
            },
            _ => Message::Binary(payload),
        };
        metrics::record_message("inbound", message.kind());
        let mut event = WebSocketEvent::Message(message);
        self.events.emit(events::MESSAGE, &mut event);
    }

    fn protocol_error(&mut self, code: u16, error: &dyn std::fmt::Display) {
        tracing::warn!(socket = %self.socket(), code, error = %error, "WebSocket protocol error");
        metrics::record_protocol_error(code);
        if self.state() == ConnectionState::Open {
            self.handle.set_state(ConnectionState::Closing);
            self.handle.write_frame(&Frame::close(Some(code)));
        }
        self.finish();
    }

    /// Drop the transport and raise `close` once.
    fn finish(&mut self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        let socket = self.socket();
        self.handle.outbound.disconnect(socket);
        self.handle.outbound.close(socket);
        self.handle.set_state(ConnectionState::Closed);
        self.inbound.clear();
        self.fragment = None;
        tracing::debug!(socket = %socket, "WebSocket closed");
        self.events.emit(events::CLOSE, &mut WebSocketEvent::Close);
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("socket", &self.socket())
            .field("state", &self.state())
            .field("buffered", &self.inbound.len())
            .field("events", &self.events)
            .finish()
    }
}
