//! Request head reassembly and decoding.
//!
//! # Responsibilities
//! - Accumulate raw bytes per connection until a full header block arrives
//! - Never re-scan bytes already known not to hold the terminator
//! - Decode the request line and headers leniently
//! - Hold bytes that arrive mid-exchange for the next request
//!
//! # Design Decisions
//! - A line terminator is LF or CRLF; CRLF is folded to LF for the header
//!   block only, bytes after the blank line are handed on untouched
//! - Missing request-line tokens become `None`, never an error
//! - A header line without a colon is skipped

use bytes::{Buf, Bytes, BytesMut};

use crate::http::headers::Headers;

/// Error type for request reassembly.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request head exceeds {limit} bytes without a terminating blank line")]
    HeaderTooLarge { limit: usize },
    #[error("more than {limit} bytes buffered while a response is in flight")]
    BufferFull { limit: usize },
}

/// Decoded request line and headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Option<String>,
    pub target: Option<String>,
    pub version: Option<String>,
    pub headers: Headers,
}

impl RequestHead {
    /// Parse a header block (without the terminating blank line).
    pub fn parse(block: &[u8]) -> Self {
        let text = String::from_utf8_lossy(block).replace("\r\n", "\n");
        let mut lines = text.split('\n');

        let mut head = RequestHead::default();
        if let Some(request_line) = lines.next() {
            let mut tokens = request_line.split_ascii_whitespace().map(str::to_owned);
            head.method = tokens.next();
            head.target = tokens.next();
            head.version = tokens.next();
        }

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim_end();
            if name.is_empty() {
                continue;
            }
            head.headers.insert(name, value.trim());
        }
        head
    }
}

/// A decoded head plus whatever followed it in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub head: RequestHead,
    pub remainder: Bytes,
}

/// Per-connection accumulator for the request head.
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    scan_cursor: usize,
    headers_complete: bool,
    max_header_bytes: usize,
}

impl Reassembler {
    pub fn new(max_header_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scan_cursor: 0,
            headers_complete: false,
            max_header_bytes,
        }
    }

    /// Append `chunk` and try to complete the head.
    ///
    /// While a decoded head is still in flight, bytes are only buffered; they
    /// are scanned by [`Reassembler::next_request`] after
    /// [`Reassembler::reset`].
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<DecodedRequest>, RequestError> {
        self.buffer.extend_from_slice(chunk);
        if self.headers_complete {
            tracing::trace!(
                bytes = chunk.len(),
                buffered = self.buffer.len(),
                "Holding bytes until the current exchange finishes"
            );
            if self.buffer.len() > self.max_header_bytes {
                return Err(RequestError::BufferFull {
                    limit: self.max_header_bytes,
                });
            }
            return Ok(None);
        }
        self.next_request()
    }

    /// Scan buffered bytes for a complete head.
    pub fn next_request(&mut self) -> Result<Option<DecodedRequest>, RequestError> {
        if self.headers_complete {
            return Ok(None);
        }
        match find_blank_line(&self.buffer, self.scan_cursor) {
            Some((block_end, head_end)) => {
                let head = RequestHead::parse(&self.buffer[..block_end]);
                self.buffer.advance(head_end);
                self.headers_complete = true;
                self.scan_cursor = 0;
                Ok(Some(DecodedRequest {
                    head,
                    remainder: Bytes::copy_from_slice(&self.buffer),
                }))
            }
            None => {
                // A terminator can start at most two bytes before the end.
                self.scan_cursor = self.buffer.len().saturating_sub(2);
                if self.buffer.len() > self.max_header_bytes {
                    return Err(RequestError::HeaderTooLarge {
                        limit: self.max_header_bytes,
                    });
                }
                Ok(None)
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.headers_complete
    }

    /// Bytes buffered but not yet part of a decoded head.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Prepare for the next request on a kept-alive connection. Bytes that
    /// arrived during the previous exchange are kept.
    pub fn reset(&mut self) {
        self.scan_cursor = 0;
        self.headers_complete = false;
    }
}

/// Find the first blank line at or after `from`.
///
/// Returns the end of the header block and the index just past the
/// terminator. A blank line is an LF followed by LF or CRLF.
fn find_blank_line(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, i + 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: localhost:5555\r\nConnection: keep-alive\r\n\r\n";

    fn decode_all(bytes: &[u8]) -> DecodedRequest {
        let mut reassembler = Reassembler::new(8192);
        reassembler.push(bytes).unwrap().expect("complete head")
    }

    #[test]
    fn decodes_request_line_and_headers() {
        let request = decode_all(GET);
        assert_eq!(request.head.method.as_deref(), Some("GET"));
        assert_eq!(request.head.target.as_deref(), Some("/index.html"));
        assert_eq!(request.head.version.as_deref(), Some("HTTP/1.1"));
        assert_eq!(request.head.headers.get("Host"), Some("localhost:5555"));
        assert_eq!(request.head.headers.get("Connection"), Some("keep-alive"));
        assert!(request.remainder.is_empty());
    }

    #[test]
    fn byte_at_a_time_matches_single_chunk() {
        let whole = decode_all(GET);

        let mut reassembler = Reassembler::new(8192);
        let mut decoded = None;
        for (i, byte) in GET.iter().enumerate() {
            let result = reassembler.push(std::slice::from_ref(byte)).unwrap();
            if result.is_some() {
                assert_eq!(i, GET.len() - 1, "decoded before the last byte");
                decoded = result;
            }
        }
        assert_eq!(decoded, Some(whole));
    }

    #[test]
    fn every_split_point_decodes_identically() {
        let whole = decode_all(GET);
        for split in 1..GET.len() {
            let mut reassembler = Reassembler::new(8192);
            let first = reassembler.push(&GET[..split]).unwrap();
            let decoded = match first {
                Some(decoded) => decoded,
                None => reassembler.push(&GET[split..]).unwrap().expect("complete"),
            };
            assert_eq!(decoded, whole, "split at {split}");
        }
    }

    #[test]
    fn bare_lf_terminators_are_accepted() {
        let request = decode_all(b"GET / HTTP/1.1\nHost: a\n\n");
        assert_eq!(request.head.headers.get("Host"), Some("a"));
    }

    #[test]
    fn short_request_line_leaves_fields_absent() {
        let request = decode_all(b"GET\r\nHost: a\r\n\r\n");
        assert_eq!(request.head.method.as_deref(), Some("GET"));
        assert_eq!(request.head.target, None);
        assert_eq!(request.head.version, None);
    }

    #[test]
    fn lines_without_colon_are_ignored() {
        let request = decode_all(b"GET / HTTP/1.1\r\ngarbage line\r\nX-Ok:  yes  \r\n\r\n");
        assert_eq!(request.head.headers.len(), 1);
        assert_eq!(request.head.headers.get("X-Ok"), Some("yes"));
    }

    #[test]
    fn value_keeps_colons() {
        let request = decode_all(b"GET / HTTP/1.1\r\nHost: example.org:8080\r\n\r\n");
        assert_eq!(request.head.headers.get("Host"), Some("example.org:8080"));
    }

    #[test]
    fn remainder_is_returned_untouched() {
        let request = decode_all(b"GET / HTTP/1.1\r\n\r\n\x81\x85\r\nabc");
        assert_eq!(&request.remainder[..], b"\x81\x85\r\nabc");
    }

    #[test]
    fn bytes_after_completion_wait_for_reset() {
        let mut reassembler = Reassembler::new(8192);
        assert!(reassembler.push(GET).unwrap().is_some());
        assert!(reassembler.is_complete());
        assert!(reassembler.push(GET).unwrap().is_none());
        assert_eq!(reassembler.buffered(), GET.len());

        reassembler.reset();
        assert!(!reassembler.is_complete());
        let next = reassembler.next_request().unwrap().expect("held request");
        assert_eq!(next, decode_all(GET));
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn pipelined_head_is_kept_as_next_request() {
        let mut both = GET.to_vec();
        both.extend_from_slice(b"GET /second HTTP/1.1\r\n\r\n");
        let mut reassembler = Reassembler::new(8192);
        let first = reassembler.push(&both).unwrap().expect("first head");
        assert_eq!(first.head.target.as_deref(), Some("/index.html"));

        reassembler.reset();
        let second = reassembler.next_request().unwrap().expect("second head");
        assert_eq!(second.head.target.as_deref(), Some("/second"));
    }

    #[test]
    fn held_bytes_are_bounded() {
        let mut reassembler = Reassembler::new(64);
        assert!(reassembler.push(b"GET / HTTP/1.1\r\n\r\n").unwrap().is_some());
        let err = reassembler.push(&[b'a'; 65]).unwrap_err();
        assert_eq!(err, RequestError::BufferFull { limit: 64 });
    }

    #[test]
    fn partial_head_waits() {
        let mut reassembler = Reassembler::new(8192);
        assert!(reassembler.push(b"GET / HTTP/1.1\r\nHost: a\r\n").unwrap().is_none());
        assert!(reassembler.push(b"\r").unwrap().is_none());
        assert_eq!(reassembler.buffered(), 26);
        assert!(reassembler.push(b"\n").unwrap().is_some());
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut reassembler = Reassembler::new(16);
        let err = reassembler.push(b"GET /a/very/long/path HTTP/1.1\r\n").unwrap_err();
        assert_eq!(err, RequestError::HeaderTooLarge { limit: 16 });
    }
}
