//! Entry point for the coverage collector.
//!
//! Usage: `coverage-collector <OUT_DIR> <PORT> [--config FILE]`

use coverage_collector::{Config, Server};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        out_dir = %config.out_dir.display(),
        idle_timeout_ms = config.idle_timeout.as_millis() as u64,
        "Starting coverage-collector"
    );

    let server = Arc::new(Server::new(config));

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                signal_server.request_shutdown();
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });

    server.run().await?;
    Ok(())
}
