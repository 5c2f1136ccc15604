//! Account Mirror Production Service Library
//!
//! Wires the synchronization engine to PostgreSQL, the broker API and the
//! Telegram notifier, and provides configuration loading, logging setup and
//! graceful shutdown handling.

use anyhow::{Context, Result};
use std::path::Path;

pub mod config;
pub mod logging;
pub mod notifier;
pub mod service;
pub mod signals;

pub use config::ServiceConfig;
pub use logging::{initialize_logging, initialize_logging_with_config};
pub use notifier::TelegramNotifier;
pub use service::ServiceState;
pub use signals::{graceful_shutdown, setup_signal_handlers};

/// Load configuration from an optional file and environment variables
pub fn load_configuration(config_file: Option<&Path>, dry_run: bool) -> Result<ServiceConfig> {
    config::load_config(config_file, dry_run).context("Failed to load service configuration")
}
