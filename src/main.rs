//! Forwarding proxy (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌────────────────────────────────────────────────────┐
//!                      │                  FORWARD PROXY                      │
//!                      │                                                    │
//!   Client Request     │  ┌─────────┐   ┌──────────┐   ┌──────────────┐    │
//!   ───────────────────┼─▶│  http   │──▶│ resolver │──▶│    proxy     │    │
//!                      │  │ server  │   └──────────┘   │ orchestrator │    │
//!                      │  └─────────┘                  └──────┬───────┘    │
//!                      │                                      │            │
//!                      │        ┌──────────────┬──────────────┤            │
//!                      │        ▼              ▼              ▼            │
//!                      │  ┌──────────┐  ┌────────────┐  ┌──────────┐       │
//!                      │  │   pool   │  │  forward   │  │resilience│       │
//!                      │  │ (shards) │  │ (attempt)  │  │ (retries)│       │
//!                      │  └────┬─────┘  └─────┬──────┘  └──────────┘       │
//!                      │       │              │                            │
//!   Client Response    │  ┌────▼──────────────▼──┐                         │
//!   ◀──────────────────┼──│  stream (pump task)  │◀────────────────────────┼── Upstream
//!                      │  └──────────────────────┘                         │
//!                      └────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;

use forward_proxy::config::{load_config, ProxyConfig};
use forward_proxy::lifecycle::{wait_for_signal, Shutdown};
use forward_proxy::observability::{logging, metrics};
use forward_proxy::HttpServer;

#[derive(Parser, Debug)]
#[command(name = "forward-proxy", version, about = "HTTP forwarding proxy")]
struct Args {
    /// Path to a TOML configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init(&config.observability)?;
    tracing::info!("forward-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = config.upstream.address.as_deref().unwrap_or("request target"),
        max_connections_per_destination = config.pool.max_connections_per_destination,
        max_retries = config.retries.max_retries,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config, shutdown.token())?;
    let mut server_task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    tokio::select! {
        _ = wait_for_signal() => shutdown.trigger(),
        result = &mut server_task => {
            result??;
            return Ok(());
        }
    }

    server_task.await??;
    tracing::info!("Shutdown complete");
    Ok(())
}
