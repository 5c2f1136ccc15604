//! Account Mirror Production Service
//!
//! Polls every active brokerage account, mirrors its state into the local
//! store and streams updates to subscribers until Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use mirror_service::{
    graceful_shutdown, initialize_logging_with_config, load_configuration, setup_signal_handlers,
    ServiceState,
};

#[derive(Parser)]
#[command(name = "account-mirror")]
#[command(about = "Mirrors brokerage accounts into a local store and streams their updates")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use an in-memory store instead of PostgreSQL
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env before reading the environment
    dotenv::dotenv().ok();

    // Load configuration
    let config = load_configuration(cli.config.as_deref(), cli.dry_run)?;

    // Initialize logging
    initialize_logging_with_config(&config.logging)?;

    info!("Starting Account Mirror Service v{}", env!("CARGO_PKG_VERSION"));

    // Create service state
    let service_state =
        Arc::new(ServiceState::new(config).await.context("Failed to initialize service")?);
    info!("Service state initialized");

    // Setup signal handlers for graceful shutdown
    let mut shutdown_signal = setup_signal_handlers()?;
    info!("Signal handlers configured");

    // Start polling workers
    let started = service_state.start().await?;
    info!(accounts = started, "Synchronization started");

    let metrics_handle = service_state.spawn_metrics_reporter();

    // Wait for shutdown signal
    info!("Account Mirror Service is running. Press Ctrl+C to shutdown gracefully.");
    let _ = shutdown_signal.recv().await;

    // Graceful shutdown
    info!("Shutdown signal received. Initiating graceful shutdown...");
    graceful_shutdown(service_state, metrics_handle).await?;

    info!("Account Mirror Service shutdown complete");
    Ok(())
}
