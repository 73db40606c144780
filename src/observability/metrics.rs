//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (connections, requests, upgrades, messages)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `socket_connections_total` (counter): accepted sockets
//! - `socket_active_connections` (gauge): registered connection records
//! - `http_requests_total` (counter): decoded requests by method (unknown
//!   methods counted as `other`)
//! - `http_unhandled_requests_total` (counter): requests no listener claimed
//! - `websocket_upgrades_total` (counter): handshakes by outcome
//! - `websocket_messages_total` (counter): messages by direction and kind
//! - `websocket_protocol_errors_total` (counter): violations by close code
//! - `transport_errors_total` (counter): receive/send failures by kind
//! - `bytes_sent_total` (counter): bytes handed to the transport by protocol
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so the protocol
//!   core records unconditionally and tests need no setup

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_connection_accepted() {
    ::metrics::counter!("socket_connections_total").increment(1);
}

pub fn record_active_connections(count: usize) {
    ::metrics::gauge!("socket_active_connections").set(count as f64);
}

pub fn record_request(method: Option<&str>) {
    ::metrics::counter!("http_requests_total", "method" => method_label(method)).increment(1);
}

/// Map a request method onto a fixed label set.
fn method_label(method: Option<&str>) -> &'static str {
    match method {
        Some("GET") => "GET",
        Some("HEAD") => "HEAD",
        Some("POST") => "POST",
        Some("PUT") => "PUT",
        Some("PATCH") => "PATCH",
        Some("DELETE") => "DELETE",
        Some("OPTIONS") => "OPTIONS",
        _ => "other",
    }
}

pub fn record_unhandled_request(event: &'static str) {
    ::metrics::counter!("http_unhandled_requests_total", "event" => event).increment(1);
}

/// `outcome` is one of `accepted`, `rejected` or `declined`.
pub fn record_upgrade(outcome: &'static str) {
    ::metrics::counter!("websocket_upgrades_total", "outcome" => outcome).increment(1);
}

pub fn record_message(direction: &'static str, kind: &'static str) {
    ::metrics::counter!(
        "websocket_messages_total",
        "direction" => direction,
        "kind" => kind
    )
    .increment(1);
}

pub fn record_protocol_error(code: u16) {
    ::metrics::counter!("websocket_protocol_errors_total", "code" => code.to_string())
        .increment(1);
}

pub fn record_transport_error(kind: &'static str) {
    ::metrics::counter!("transport_errors_total", "kind" => kind).increment(1);
}

pub fn record_bytes_sent(protocol: &'static str, bytes: usize) {
    ::metrics::counter!("bytes_sent_total", "protocol" => protocol).increment(bytes as u64);
}
