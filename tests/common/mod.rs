//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::time::Duration;

use socket_runtime::config::ServerConfig;
use socket_runtime::http::HttpServer;
use socket_runtime::lifecycle::{self, Launched};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Upper bound for any single network wait in tests.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Default configuration bound to an ephemeral loopback port.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config
}

/// Start a server with handlers registered by `configure`.
pub async fn start_server<F>(configure: F) -> Launched
where
    F: FnOnce(&mut HttpServer),
{
    lifecycle::launch(&test_config(), configure)
        .await
        .expect("server should start")
}

/// Read from `stream` until the accumulated bytes end with `suffix`.
pub async fn read_until(stream: &mut TcpStream, suffix: &[u8]) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(TIMEOUT, async {
        while !received.ends_with(suffix) {
            let n = stream.read(&mut buf).await.expect("read failed");
            assert!(n > 0, "connection closed early: {:?}", String::from_utf8_lossy(&received));
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("timed out waiting for response");
    received
}

/// Read until the peer closes the connection.
pub async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let result = tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut received))
        .await
        .expect("timed out waiting for close");
    // A reset is also the server closing the connection.
    if let Err(e) = result {
        assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset, "{e}");
    }
    received
}
