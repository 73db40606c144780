//! Startup orchestration.
//!
//! # Responsibilities
//! - Bind the listener
//! - Wire transport and protocol core together through channels
//! - Let the caller register handlers before traffic flows
//! - Spawn the transport and server loops
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Handlers are registered before the loops start (traffic only when ready)

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::http::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::net::transport::TcpTransport;
use crate::net::Outbound;

/// How long [`Launched::stop`] waits for sockets to be released.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to start listener: {0}")]
    Listener(#[from] ListenerError),
    #[error("failed to read bound address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// A running server.
#[derive(Debug)]
pub struct Launched {
    /// Address actually bound (useful with port 0).
    pub local_addr: SocketAddr,
    pub shutdown: Shutdown,
    /// Live socket count.
    pub tracker: ConnectionTracker,
    tasks: Vec<JoinHandle<()>>,
}

impl Launched {
    /// Signal shutdown, wait for both loops to exit and for sockets to drain.
    pub async fn stop(self) {
        self.shutdown.trigger();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Server task ended abnormally");
            }
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait_for_drain())
            .await
            .is_err()
        {
            tracing::warn!(
                open_sockets = self.tracker.active_count(),
                "Sockets still open after drain timeout"
            );
        }
        tracing::info!("Shutdown complete");
    }
}

/// Bind, let `configure` register handlers, and start serving.
pub async fn launch<F>(config: &ServerConfig, configure: F) -> Result<Launched, StartupError>
where
    F: FnOnce(&mut HttpServer),
{
    let listener = Listener::bind(&config.listener).await?;
    let local_addr = listener.local_addr().map_err(StartupError::LocalAddr)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound, commands_rx) = Outbound::channel();

    let mut server = HttpServer::new(config, outbound);
    configure(&mut server);

    let transport = TcpTransport::new(listener, events_tx, commands_rx);
    let tracker = transport.tracker();
    let shutdown = Shutdown::new();

    let tasks = vec![
        tokio::spawn(transport.run(shutdown.subscribe())),
        tokio::spawn(server.run(events_rx, shutdown.subscribe())),
    ];

    tracing::info!(
        address = %local_addr,
        websocket = config.websocket.enabled,
        "Server started"
    );

    Ok(Launched {
        local_addr,
        shutdown,
        tracker,
        tasks,
    })
}
