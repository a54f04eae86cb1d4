//! # Parlor Server
//!
//! Realtime chat relay: rooms, presence and persisted message fan-out over
//! WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parlor
//!
//! # Run with a specific config file
//! PARLOR_CONFIG=/path/to/parlor.toml parlor
//!
//! # Override individual settings
//! PARLOR_PORT=9000 PARLOR_STORAGE__BACKEND=sqlite parlor
//! ```

mod config;
mod handlers;
mod metrics;
mod storage;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        storage = ?config.storage.backend,
        "Starting Parlor server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
