//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// HTTP request decoding limits.
    pub http: HttpConfig,

    /// WebSocket upgrade and framing settings.
    pub websocket: WebSocketConfig,

    /// Message runtime served over WebSocket.
    pub runtime: RuntimeConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:5555").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5555".to_string(),
            max_connections: 10_000,
        }
    }
}

/// HTTP decoding configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Largest request head accepted before the connection is closed.
    pub max_header_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
        }
    }
}

/// WebSocket configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Offer upgrade requests to the WebSocket server.
    pub enabled: bool,

    /// Largest message (sum of fragments) accepted, in bytes.
    pub max_message_size: usize,

    /// Answer PING frames with a PONG automatically.
    pub auto_pong: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_message_size: 16 * 1024 * 1024,
            auto_pong: true,
        }
    }
}

/// Runtime description served to clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Accept WebSocket upgrades into the message runtime.
    pub enabled: bool,

    /// Runtime type reported by `runtime/getruntime`.
    pub runtime_type: String,

    /// Human readable label.
    pub label: String,

    /// Protocol version spoken.
    pub protocol_version: String,

    /// Capabilities advertised to clients.
    pub capabilities: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            runtime_type: "socket-runtime".to_string(),
            label: "Socket runtime".to_string(),
            protocol_version: "0.7".to_string(),
            capabilities: vec!["protocol:runtime".to_string()],
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
