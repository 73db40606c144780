//! Opening handshake: request validation and the `101` response headers.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::http::headers::Headers;
use crate::http::request::RequestHead;
use crate::http::response::ResponseError;

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("request does not ask for a websocket upgrade")]
    NotWebSocket,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("upgrade already accepted")]
    AlreadyAccepted,
    #[error("request already closed")]
    Closed,
    #[error(transparent)]
    Response(#[from] ResponseError),
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn derive_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Check that `head` is a websocket upgrade this server can answer.
pub fn validate(head: &RequestHead) -> Result<(), HandshakeError> {
    if !head.headers.value_is("Upgrade", "websocket") {
        return Err(HandshakeError::NotWebSocket);
    }
    if !head.headers.contains("Sec-WebSocket-Key") {
        return Err(HandshakeError::MissingKey);
    }
    Ok(())
}

/// First subprotocol offered in `Sec-WebSocket-Protocol`.
pub fn first_protocol(headers: &Headers) -> Option<&str> {
    headers
        .get("Sec-WebSocket-Protocol")?
        .split(',')
        .map(str::trim)
        .find(|p| !p.is_empty())
}

/// Headers of the `101 Switching Protocols` response.
pub fn response_headers(key: &str, protocol: Option<&str>) -> Headers {
    let mut headers = Headers::from([
        ("Upgrade", "websocket"),
        ("Connection", "Upgrade"),
    ]);
    headers.insert("Sec-WebSocket-Accept", derive_accept_key(key));
    if let Some(protocol) = protocol {
        headers.insert("Sec-WebSocket-Protocol", protocol);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(pairs: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: Some("GET".into()),
            target: Some("/".into()),
            version: Some("HTTP/1.1".into()),
            headers: pairs.iter().copied().collect(),
        }
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            derive_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn validation() {
        assert_eq!(
            validate(&head(&[("Upgrade", "WebSocket"), ("Sec-WebSocket-Key", "k")])),
            Ok(())
        );
        assert_eq!(
            validate(&head(&[("Upgrade", "h2c"), ("Sec-WebSocket-Key", "k")])),
            Err(HandshakeError::NotWebSocket)
        );
        assert_eq!(
            validate(&head(&[("Upgrade", "websocket")])),
            Err(HandshakeError::MissingKey)
        );
    }

    #[test]
    fn echoes_first_protocol_only() {
        let headers = Headers::from([("Sec-WebSocket-Protocol", " noflo , chat")]);
        assert_eq!(first_protocol(&headers), Some("noflo"));
        assert_eq!(first_protocol(&Headers::new()), None);

        let response = response_headers("dGhlIHNhbXBsZSBub25jZQ==", Some("noflo"));
        assert_eq!(response.get("Sec-WebSocket-Protocol"), Some("noflo"));
        assert_eq!(response.get("Sec-WebSocket-Accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(response.get("Connection"), Some("Upgrade"));
    }
}
