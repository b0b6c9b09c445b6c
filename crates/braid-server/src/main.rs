//! # Braid Server
//!
//! Distributed key/value synchronization broker.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! braid
//!
//! # Run with custom config
//! braid --config /path/to/braid.toml
//!
//! # Run with environment variables
//! BRAID_PORT=8080 BRAID_HOST=0.0.0.0 braid
//! ```

use anyhow::{bail, Result};
use braid_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "braid=debug,braid_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match config_path()? {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    tracing::info!("Starting braid server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

fn config_path() -> Result<Option<String>> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (None, _) => Ok(None),
        (Some("--config" | "-c"), Some(path)) => Ok(Some(path)),
        (Some(other), _) => bail!("Unknown argument {other}, usage: braid [--config <path>]"),
    }
}
