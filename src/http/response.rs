//! Response composition for a decoded request.
//!
//! # Responsibilities
//! - Write the status line and headers once per request
//! - Frame the body as chunks on keep-alive connections without a length
//! - Account for bytes in flight and close only once they are flushed
//!
//! # Design Decisions
//! - The body length is resolved by chunking only on keep-alive connections;
//!   otherwise closing the socket delimits the body
//! - Closing a keep-alive request releases the socket back to the server
//!   instead of closing it

use std::io;

use bytes::{BufMut, Bytes, BytesMut};

use crate::http::headers::Headers;
use crate::http::request::RequestHead;
use crate::net::{Attachment, ConnectionState, Lease, Outbound, SocketId};
use crate::observability::metrics;

/// The only protocol version spoken.
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// Error type for response writes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response head already sent")]
    HeadersAlreadySent,
    #[error("response head not sent yet")]
    HeadersNotSent,
    #[error("response already finished")]
    Finished,
    #[error("request no longer owns a socket")]
    Detached,
}

/// Reason phrase for `code`.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// An HTTP request and the response being written for it.
#[derive(Debug)]
pub struct HttpRequest {
    head: RequestHead,
    response_headers: Headers,
    headers_sent: bool,
    chunked: bool,
    keep_alive: bool,
    attachment: Option<Attachment>,
    outbound: Outbound,
    unflushed: usize,
    finished: bool,
    state: ConnectionState,
    transport_closed: bool,
}

impl HttpRequest {
    pub(crate) fn new(head: RequestHead, attachment: Attachment, outbound: Outbound) -> Self {
        let keep_alive = head.headers.value_is("Connection", "keep-alive");
        Self {
            head,
            response_headers: Headers::new(),
            headers_sent: false,
            chunked: false,
            keep_alive,
            attachment: Some(attachment),
            outbound,
            unflushed: 0,
            finished: false,
            state: ConnectionState::Open,
            transport_closed: false,
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    pub fn method(&self) -> Option<&str> {
        self.head.method.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.head.target.as_deref()
    }

    pub fn version(&self) -> &'static str {
        HTTP_VERSION
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Socket this request currently writes to.
    pub fn socket(&self) -> Option<SocketId> {
        self.attachment.map(|a| a.socket)
    }

    pub(crate) fn lease(&self) -> Option<Lease> {
        self.attachment.map(|a| a.lease)
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Bytes handed to the transport and not yet acknowledged.
    pub fn unflushed_bytes(&self) -> usize {
        self.unflushed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether closing this request also closed the socket.
    pub fn transport_closed(&self) -> bool {
        self.transport_closed
    }

    /// Write the status line and `headers`.
    pub fn write_head(&mut self, status: u16, mut headers: Headers) -> Result<(), ResponseError> {
        if self.headers_sent {
            return Err(ResponseError::HeadersAlreadySent);
        }
        if self.attachment.is_none() {
            return Err(ResponseError::Detached);
        }

        // A 101 response hands the socket to another protocol and has no body.
        if self.keep_alive && status != 101 {
            headers.insert("Connection", "keep-alive");
            if !headers.contains("Content-Length") {
                headers.insert("Transfer-Encoding", "chunked");
            }
        }
        self.chunked = headers.value_is("Transfer-Encoding", "chunked");

        let mut head = format!("{} {} {}", HTTP_VERSION, status, reason_phrase(status));
        for (name, value) in headers.iter() {
            head.push_str("\r\n");
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
        }
        head.push_str("\r\n\r\n");

        tracing::debug!(
            socket = ?self.socket(),
            status,
            chunked = self.chunked,
            keep_alive = self.keep_alive,
            "Writing response head"
        );

        self.response_headers = headers;
        self.headers_sent = true;
        self.send_raw(Bytes::from(head));
        Ok(())
    }

    /// Write body bytes. In chunked mode every call becomes one chunk; an
    /// empty write yields a zero-length chunk.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> Result<(), ResponseError> {
        let data = data.as_ref();
        if !self.headers_sent {
            return Err(ResponseError::HeadersNotSent);
        }
        if self.finished {
            return Err(ResponseError::Finished);
        }
        if self.attachment.is_none() {
            return Err(ResponseError::Detached);
        }

        if self.chunked {
            let size = format!("{:X}\r\n", data.len());
            let mut chunk = BytesMut::with_capacity(size.len() + data.len() + 2);
            chunk.put_slice(size.as_bytes());
            chunk.put_slice(data);
            chunk.put_slice(b"\r\n");
            self.send_raw(chunk.freeze());
        } else if !data.is_empty() {
            self.send_raw(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    /// Finish the response, closing the request once everything is flushed.
    pub fn end(&mut self) -> Result<(), ResponseError> {
        self.end_with(b"")
    }

    /// Write `data` (if non-empty) and finish the response.
    pub fn end_with(&mut self, data: impl AsRef<[u8]>) -> Result<(), ResponseError> {
        let data = data.as_ref();
        if !data.is_empty() {
            self.write(data)?;
        }
        if self.chunked {
            self.write(b"")?;
        }
        if self.finished {
            return Err(ResponseError::Finished);
        }
        self.finished = true;
        if self.unflushed > 0 {
            self.state = ConnectionState::Closing;
        }
        self.check_finished();
        Ok(())
    }

    /// Stop using the socket. Non-keep-alive sockets are closed as well.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(attachment) = self.attachment.take() {
            if !self.keep_alive {
                self.outbound.close(attachment.socket);
                self.transport_closed = true;
            }
            tracing::debug!(
                socket = %attachment.socket,
                transport_closed = self.transport_closed,
                "Request closed"
            );
        }
        self.state = ConnectionState::Closed;
    }

    /// Transport acknowledgement for one of this request's writes.
    pub(crate) fn on_sent(&mut self, result: io::Result<usize>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        match result {
            Ok(sent) => {
                self.unflushed = self.unflushed.saturating_sub(sent);
                self.check_finished();
            }
            Err(e) => {
                tracing::warn!(socket = ?self.socket(), error = %e, "Error writing to socket");
                metrics::record_transport_error("send");
                self.abort();
            }
        }
    }

    /// Close the socket immediately, keep-alive or not.
    pub fn abort(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            self.outbound.close(attachment.socket);
            self.transport_closed = true;
            tracing::debug!(socket = %attachment.socket, "Request aborted");
        }
        self.state = ConnectionState::Closed;
    }

    /// Give up the socket so another record can own it.
    pub(crate) fn detach(&mut self) -> Option<Attachment> {
        self.attachment.take()
    }

    pub(crate) fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    fn send_raw(&mut self, data: Bytes) {
        let Some(attachment) = self.attachment else {
            return;
        };
        self.unflushed += data.len();
        metrics::record_bytes_sent("http", data.len());
        self.outbound.send(attachment.socket, attachment.lease, data);
    }

    fn check_finished(&mut self) {
        if !self.finished || self.unflushed > 0 {
            return;
        }
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http::request::Reassembler;
    use crate::net::TransportCommand;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) fn request(raw: &[u8]) -> (HttpRequest, UnboundedReceiver<TransportCommand>) {
        let head = Reassembler::new(8192)
            .push(raw)
            .unwrap()
            .expect("complete head")
            .head;
        let (outbound, rx) = Outbound::channel();
        (HttpRequest::new(head, Attachment::new(SocketId::next()), outbound), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<TransportCommand>) -> Vec<TransportCommand> {
        let mut out = Vec::new();
        while let Ok(command) = rx.try_recv() {
            out.push(command);
        }
        out
    }

    fn sent_bytes(commands: &[TransportCommand]) -> Vec<u8> {
        commands
            .iter()
            .filter_map(|c| match c {
                TransportCommand::Send { data, .. } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Decode a chunked body into (length, payload) records.
    fn parse_chunks(mut body: &[u8]) -> Vec<(usize, Vec<u8>)> {
        let mut chunks = Vec::new();
        while !body.is_empty() {
            let line_end = body.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(std::str::from_utf8(&body[..line_end]).unwrap(), 16).unwrap();
            let start = line_end + 2;
            chunks.push((size, body[start..start + size].to_vec()));
            assert_eq!(&body[start + size..start + size + 2], b"\r\n");
            body = &body[start + size + 2..];
        }
        chunks
    }

    const KEEP_ALIVE: &[u8] = b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
    const CLOSE: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";

    #[test]
    fn reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(101), "Switching Protocols");
        assert_eq!(reason_phrase(299), "Unknown");
    }

    #[test]
    fn keep_alive_without_length_is_chunked() {
        let (mut req, mut rx) = request(KEEP_ALIVE);
        req.write_head(200, Headers::from([("Content-Type", "text/plain")])).unwrap();

        assert!(req.is_chunked());
        assert_eq!(req.response_headers().get("Transfer-Encoding"), Some("chunked"));
        assert_eq!(req.response_headers().get("Connection"), Some("keep-alive"));
        let head = String::from_utf8(sent_bytes(&drain(&mut rx))).unwrap();
        assert_eq!(
            head,
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: keep-alive\r\nTransfer-Encoding: chunked\r\n\r\n"
        );
    }

    #[test]
    fn keep_alive_with_length_is_not_chunked() {
        let (mut req, _rx) = request(KEEP_ALIVE);
        req.write_head(200, Headers::from([("Content-Length", "3")])).unwrap();
        assert!(!req.is_chunked());
        assert!(!req.response_headers().contains("Transfer-Encoding"));
    }

    #[test]
    fn plain_connection_is_never_chunked() {
        let (mut req, _rx) = request(CLOSE);
        req.write_head(200, Headers::from([("Connection", "keep-alive")])).unwrap();
        assert!(!req.is_chunked());
        assert!(!req.response_headers().contains("Transfer-Encoding"));
    }

    #[test]
    fn chunked_writes_frame_each_call() {
        let (mut req, mut rx) = request(KEEP_ALIVE);
        req.write_head(200, Headers::new()).unwrap();
        let head_len = sent_bytes(&drain(&mut rx)).len();
        assert_eq!(req.unflushed_bytes(), head_len);

        req.write("ab").unwrap();
        req.write("").unwrap();
        req.write("cde").unwrap();
        req.end().unwrap();

        let body = sent_bytes(&drain(&mut rx));
        assert_eq!(
            parse_chunks(&body),
            vec![
                (2, b"ab".to_vec()),
                (0, Vec::new()),
                (3, b"cde".to_vec()),
                (0, Vec::new()),
            ]
        );
        assert_eq!(req.unflushed_bytes(), head_len + body.len());
        assert_eq!(req.state(), ConnectionState::Closing);
    }

    #[test]
    fn chunk_size_is_uppercase_hex() {
        let (mut req, mut rx) = request(KEEP_ALIVE);
        req.write_head(200, Headers::new()).unwrap();
        drain(&mut rx);
        req.write(vec![b'x'; 255]).unwrap();
        let bytes = sent_bytes(&drain(&mut rx));
        assert!(bytes.starts_with(b"FF\r\n"));
    }

    #[test]
    fn closes_only_after_flush() {
        let (mut req, mut rx) = request(CLOSE);
        req.write_head(200, Headers::from([("Content-Length", "5")])).unwrap();
        req.end_with("hello").unwrap();

        let commands = drain(&mut rx);
        assert!(commands.iter().all(|c| matches!(c, TransportCommand::Send { .. })));
        let total = sent_bytes(&commands).len();
        assert_eq!(req.state(), ConnectionState::Closing);

        req.on_sent(Ok(total - 5));
        assert_eq!(req.state(), ConnectionState::Closing);
        assert!(drain(&mut rx).is_empty());

        req.on_sent(Ok(5));
        assert_eq!(req.state(), ConnectionState::Closed);
        assert!(req.transport_closed());
        let socket = req.socket();
        assert_eq!(socket, None);
        assert!(matches!(drain(&mut rx).as_slice(), [TransportCommand::Close { .. }]));

        // Late acknowledgements are harmless.
        req.on_sent(Ok(1));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn keep_alive_close_keeps_socket_open() {
        let (mut req, mut rx) = request(KEEP_ALIVE);
        req.write_head(200, Headers::new()).unwrap();
        req.end().unwrap();
        let total = sent_bytes(&drain(&mut rx)).len();

        req.on_sent(Ok(total));
        assert_eq!(req.state(), ConnectionState::Closed);
        assert!(!req.transport_closed());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let (mut req, mut rx) = request(CLOSE);
        req.close();
        req.close();
        let closes = drain(&mut rx)
            .into_iter()
            .filter(|c| matches!(c, TransportCommand::Close { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn write_errors_close_the_socket() {
        let (mut req, mut rx) = request(KEEP_ALIVE);
        req.write_head(200, Headers::new()).unwrap();
        drain(&mut rx);
        req.on_sent(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert_eq!(req.state(), ConnectionState::Closed);
        assert!(req.transport_closed());
        assert!(matches!(drain(&mut rx).as_slice(), [TransportCommand::Close { .. }]));
    }

    #[test]
    fn misuse_is_reported() {
        let (mut req, _rx) = request(CLOSE);
        assert_eq!(req.write("x"), Err(ResponseError::HeadersNotSent));
        req.write_head(200, Headers::new()).unwrap();
        assert_eq!(req.write_head(200, Headers::new()), Err(ResponseError::HeadersAlreadySent));
        req.end().unwrap();
        assert_eq!(req.write("x"), Err(ResponseError::Finished));
    }

    #[test]
    fn detached_request_cannot_write() {
        let (mut req, mut rx) = request(CLOSE);
        assert!(req.detach().is_some());
        assert_eq!(req.write_head(200, Headers::new()), Err(ResponseError::Detached));

        // Closing a detached request leaves the socket to its new owner.
        req.close();
        assert_eq!(req.state(), ConnectionState::Closed);
        assert!(!req.transport_closed());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn switching_protocols_is_never_chunked() {
        let (mut req, _rx) = request(KEEP_ALIVE);
        req.write_head(101, Headers::from([("Connection", "Upgrade")])).unwrap();
        assert!(!req.is_chunked());
        assert_eq!(req.response_headers().get("Connection"), Some("Upgrade"));
    }

    #[test]
    fn abort_closes_keep_alive_socket() {
        let (mut req, mut rx) = request(KEEP_ALIVE);
        req.abort();
        assert!(req.transport_closed());
        assert!(matches!(drain(&mut rx).as_slice(), [TransportCommand::Close { .. }]));
    }
}
