//! Configuration for the synchronization engine

use crate::error::{Result, SyncError};
use crate::{DEFAULT_IO_TIMEOUT_MS, DEFAULT_LISTENER_BUFFER, DEFAULT_POLL_INTERVAL_MS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the polling scheduler and broadcast hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval between cycles of the same account, in milliseconds
    pub poll_interval_ms: u64,

    /// Upper bound for any single broker or persistence call
    pub io_timeout_ms: u64,

    /// Buffer size of channel listeners created through the hub
    pub listener_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            listener_buffer: DEFAULT_LISTENER_BUFFER,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(SyncError::ConfigurationError(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(SyncError::ConfigurationError(
                "io_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.listener_buffer == 0 {
            return Err(SyncError::ConfigurationError(
                "listener_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
