//! proxy-discovery
//!
//! Publishes routing configuration for a reverse proxy from the labels of
//! running containers or cluster services.
//!
//! # Architecture Overview
//!
//! ```text
//!   container engine                      ┌──────────────────────────────┐
//!   (unix / tcp API)                      │        proxy-discovery       │
//!         │                               │                              │
//!         │  list / inspect / events      │  ┌────────────┐              │
//!         ├──────────────────────────────▶│  │ discovery  │  docker.rs   │
//!         │                               │  │  adapters  │  swarm.rs    │
//!         │                               │  └─────┬──────┘              │
//!                                         │        ▼                     │
//!                                         │  ┌────────────┐              │
//!                                         │  │  provider  │ eligibility  │
//!                                         │  │ reconciler │ builder      │
//!                                         │  │            │ merge        │
//!                                         │  └─────┬──────┘              │
//!                                         │        ▼  mpsc<Message>      │
//!                                         │  ┌────────────┐  ┌─────────┐ │
//!                                         │  │ ConfigStore│─▶│ admin   │ │──▶ GET /api/rawdata
//!                                         │  └────────────┘  └─────────┘ │
//!                                         │                              │
//!                                         │  config · lifecycle ·        │
//!                                         │  observability · resilience  │
//!                                         └──────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use proxy_discovery::admin::{self, AdminState, ConfigStore};
use proxy_discovery::config::loader::load_config;
use proxy_discovery::discovery::{DockerConnector, SwarmConnector};
use proxy_discovery::lifecycle::{signals, Shutdown};
use proxy_discovery::observability::{logging, metrics};
use proxy_discovery::provider::watch::refresh_interval;
use proxy_discovery::provider::{Reconciler, WatchLoop};

/// Capacity of the provider → aggregator channel.
const MESSAGE_BUFFER: usize = 16;

#[derive(Debug, Parser)]
#[command(name = "proxy-discovery", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "discovery.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    logging::init_logging(&config.observability)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "proxy-discovery starting"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let shutdown = Shutdown::new();
    let store = Arc::new(ConfigStore::new());
    let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
    let mut tasks = Vec::new();

    let aggregator = {
        let store = store.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move { store.consume(rx, shutdown_rx).await })
    };

    if let Some(docker) = &config.docker {
        let options = Arc::new(docker.options.clone());
        let reconciler = Reconciler::new("docker", options.clone())?;
        let watch = WatchLoop::new(reconciler, DockerConnector::new(options.clone()), options.watch, tx.clone());
        tasks.push(tokio::spawn(watch.run(shutdown.subscribe())));
    }

    if let Some(swarm) = &config.swarm {
        let options = Arc::new(swarm.options.clone());
        let reconciler = Reconciler::new("swarm", options.clone())?;
        let connector = SwarmConnector::new(options.clone(), refresh_interval(swarm.refresh_seconds));
        let watch = WatchLoop::new(reconciler, connector, options.watch, tx.clone());
        tasks.push(tokio::spawn(watch.run(shutdown.subscribe())));
    }
    drop(tx);

    if tasks.is_empty() {
        tracing::warn!("No provider configured, nothing will be published");
    }

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState::new(store.clone(), &config.admin.api_key);
        let shutdown_rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, state, shutdown_rx).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
    }

    signals::shutdown_on_signal(shutdown.clone()).await;

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Task failed during shutdown");
        }
    }
    if let Err(e) = aggregator.await {
        tracing::error!(error = %e, "Aggregator failed during shutdown");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
