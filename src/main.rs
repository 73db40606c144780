//! Socket runtime server.
//!
//! # Architecture Overview
//!
//! ```text
//!                   ┌──────────────────────────────────────────────────────┐
//!                   │                    SOCKET RUNTIME                    │
//!                   │                                                      │
//!    TCP client     │  ┌───────────┐  events   ┌────────────┐              │
//!    ───────────────┼─▶│ transport │──────────▶│ http       │──▶ request   │
//!                   │  │ (tokio)   │           │ server     │──▶ upgrade   │
//!                   │  │           │◀──────────│ + registry │              │
//!                   │  └───────────┘ commands  └─────┬──────┘              │
//!                   │                                │ Upgrade: websocket  │
//!                   │                                ▼                     │
//!                   │                          ┌────────────┐  envelopes   │
//!                   │                          │ websocket  │──▶ runtime   │
//!                   │                          └────────────┘              │
//!                   └──────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use socket_runtime::config::{self, ServerConfig};
use socket_runtime::events;
use socket_runtime::http::Headers;
use socket_runtime::lifecycle::{self, signals};
use socket_runtime::observability::{logging, metrics};
use socket_runtime::runtime::{BasicRuntime, RuntimeServer};

#[derive(Parser, Debug)]
#[command(name = "socket-runtime")]
#[command(about = "HTTP/1.1 and WebSocket server hosting a JSON message runtime", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Override `observability.log_level`.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    config::validate_config(&config).map_err(config::ConfigError::Validation)?;

    logging::init(&config.observability)?;
    tracing::info!("socket-runtime v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        websocket = config.websocket.enabled,
        runtime = config.runtime.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let runtime_config = config.runtime.clone();
    let launched = lifecycle::launch(&config, |server| {
        server.on(events::REQUEST, |request| {
            let body = format!("socket-runtime {}\n", request.url().unwrap_or("/"));
            let headers = Headers::from([
                ("Content-Type", "text/plain".to_owned()),
                ("Content-Length", body.len().to_string()),
            ]);
            match request.write_head(200, headers).and_then(|()| request.end_with(&body)) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to write status response");
                    false
                }
            }
        });

        if runtime_config.enabled {
            RuntimeServer::attach(server.websocket_mut(), BasicRuntime::new(runtime_config));
        }
    })
    .await?;

    tracing::info!(address = %launched.local_addr, "Listening for connections");

    signals::wait_for_shutdown().await;
    launched.stop().await;
    Ok(())
}
