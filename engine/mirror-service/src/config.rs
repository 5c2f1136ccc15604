//! Service configuration management
//!
//! Layering, lowest to highest precedence: built-in defaults, an optional
//! TOML file, then environment variables.

use anyhow::{Context, Result};
use broker_client::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sync_engine::SyncConfig;

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Database connection settings
    pub database: DatabaseConfig,

    /// Polling scheduler and broadcast hub settings
    pub sync: SyncConfig,

    /// Broker API settings
    pub broker: BrokerConfig,

    /// Deal notification settings
    pub telegram: TelegramConfig,

    /// Service-level configuration
    pub service: ServiceSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Telegram bot used for "new trade closed" messages; disabled unless both are set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_base_url: String,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Use the in-memory store instead of PostgreSQL
    pub dry_run: bool,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,

    /// Interval between metrics log lines, 0 disables them
    pub metrics_log_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: String::new(), max_connections: 10 }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self { bot_token: None, chat_id: None, api_base_url: "https://api.telegram.org".to_string() }
    }
}

impl TelegramConfig {
    pub fn is_enabled(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self { dry_run: false, shutdown_timeout_secs: 10, metrics_log_interval_secs: 60 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// Load configuration from an optional file and the process environment.
///
/// `force_dry_run` (the `--dry-run` flag) wins over every other source.
pub fn load_config(config_file: Option<&Path>, force_dry_run: bool) -> Result<ServiceConfig> {
    let mut config = match config_file {
        Some(path) => {
            tracing::debug!("Loading configuration from file: {:?}", path);
            load_from_file(path)?
        }
        None => ServiceConfig::default(),
    };

    // Override with environment variables
    apply_env(&mut config, |key| std::env::var(key).ok())?;
    if force_dry_run {
        config.service.dry_run = true;
    }

    // Validate configuration
    validate_config(&config)?;

    Ok(config)
}

/// Load configuration from a TOML file; missing keys keep their defaults
fn load_from_file(path: &Path) -> Result<ServiceConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(true))
        .build()
        .with_context(|| format!("Failed to read configuration file: {:?}", path))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Invalid configuration file: {:?}", path))
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| anyhow::anyhow!("Invalid {}: {}", key, value))
}

/// Apply environment overrides read through `lookup`
fn apply_env(config: &mut ServiceConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(url) = lookup("DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(value) = lookup("DATABASE_MAX_CONNECTIONS") {
        config.database.max_connections = parse_var("DATABASE_MAX_CONNECTIONS", &value)?;
    }

    if let Some(value) = lookup("MIRROR_POLL_INTERVAL_MS") {
        config.sync.poll_interval_ms = parse_var("MIRROR_POLL_INTERVAL_MS", &value)?;
    }
    if let Some(value) = lookup("MIRROR_IO_TIMEOUT_MS") {
        config.sync.io_timeout_ms = parse_var("MIRROR_IO_TIMEOUT_MS", &value)?;
    }
    if let Some(value) = lookup("MIRROR_LISTENER_BUFFER") {
        config.sync.listener_buffer = parse_var("MIRROR_LISTENER_BUFFER", &value)?;
    }

    if let Some(url) = lookup("BROKER_BASE_URL") {
        config.broker.api_base_url = url;
    }
    if let Some(value) = lookup("BROKER_REQUEST_TIMEOUT_MS") {
        config.broker.request_timeout_ms = parse_var("BROKER_REQUEST_TIMEOUT_MS", &value)?;
    }
    if let Some(value) = lookup("BROKER_PAGE_LIMIT") {
        config.broker.page_limit = parse_var("BROKER_PAGE_LIMIT", &value)?;
    }

    if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
        config.telegram.bot_token = Some(token).filter(|t| !t.is_empty());
    }
    if let Some(chat_id) = lookup("TELEGRAM_CHAT_ID") {
        config.telegram.chat_id = Some(chat_id).filter(|c| !c.is_empty());
    }

    if let Some(level) = lookup("MIRROR_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(format) = lookup("MIRROR_LOG_FORMAT") {
        config.logging.format = format;
    }

    if let Some(value) = lookup("MIRROR_DRY_RUN") {
        config.service.dry_run = parse_var("MIRROR_DRY_RUN", &value)?;
    }
    if let Some(value) = lookup("MIRROR_SHUTDOWN_TIMEOUT_SECS") {
        config.service.shutdown_timeout_secs = parse_var("MIRROR_SHUTDOWN_TIMEOUT_SECS", &value)?;
    }
    if let Some(value) = lookup("MIRROR_METRICS_INTERVAL_SECS") {
        config.service.metrics_log_interval_secs =
            parse_var("MIRROR_METRICS_INTERVAL_SECS", &value)?;
    }

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &ServiceConfig) -> Result<()> {
    // Validate log level
    match config.logging.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow::anyhow!("Invalid log level: {}", config.logging.level)),
    }

    // Validate log format
    match config.logging.format.as_str() {
        "json" | "pretty" | "compact" => {}
        _ => return Err(anyhow::anyhow!("Invalid log format: {}", config.logging.format)),
    }

    if !config.service.dry_run && config.database.url.is_empty() {
        return Err(anyhow::anyhow!("DATABASE_URL is required unless running in dry-run mode"));
    }
    if config.database.max_connections == 0 {
        return Err(anyhow::anyhow!("database.max_connections must be greater than zero"));
    }

    config.sync.validate().context("Invalid sync configuration")?;

    if config.telegram.bot_token.is_some() != config.telegram.chat_id.is_some() {
        return Err(anyhow::anyhow!("TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.sync.poll_interval_ms, 5_000);
        assert_eq!(config.logging.level, "info");
        assert!(!config.telegram.is_enabled());
        // No database configured
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        apply_env(
            &mut config,
            env(&[
                ("DATABASE_URL", "postgres://localhost/mirror"),
                ("MIRROR_POLL_INTERVAL_MS", "3000"),
                ("TELEGRAM_BOT_TOKEN", "bot"),
                ("TELEGRAM_CHAT_ID", "42"),
                ("MIRROR_LOG_FORMAT", "json"),
            ]),
        )
        .unwrap();

        assert_eq!(config.database.url, "postgres://localhost/mirror");
        assert_eq!(config.sync.poll_interval_ms, 3_000);
        assert!(config.telegram.is_enabled());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = ServiceConfig::default();
        let err = apply_env(&mut config, env(&[("MIRROR_IO_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("MIRROR_IO_TIMEOUT_MS"));
    }

    #[test]
    fn test_half_configured_telegram_rejected() {
        let mut config = ServiceConfig::default();
        config.service.dry_run = true;
        config.telegram.bot_token = Some("bot".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgres://db/mirror"

[sync]
poll_interval_ms = 2500

[logging]
format = "compact"
"#
        )
        .unwrap();

        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.database.url, "postgres://db/mirror");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.sync.poll_interval_ms, 2_500);
        assert_eq!(config.sync.io_timeout_ms, 10_000);
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.logging.level, "info");
        assert!(validate_config(&config).is_ok());
    }
}
