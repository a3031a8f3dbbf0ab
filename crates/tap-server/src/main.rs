//! # tapd
//!
//! Message bus server with a built-in traffic debugger.
//!
//! Clients connect over WebSocket, are assigned a bus address, and exchange
//! packets with each other. Packets addressed to `$transport` are
//! administrative: they can watch live traffic, list API endpoints, and
//! snapshot bus metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (or ./tapd.toml if present)
//! tapd
//!
//! # Run with environment variables
//! TAPD_PORT=8080 TAPD_HOST=0.0.0.0 tapd
//! ```

mod bus;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tapd=debug,tap_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting tapd on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
