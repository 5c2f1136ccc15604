//! Configuration for the broker client

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Base URL of the broker REST API
    pub api_base_url: String,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Page size requested for order and deal listings
    pub page_limit: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.stockstrader.com/api/v1".to_string(),
            request_timeout_ms: 8_000,
            page_limit: 100,
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
