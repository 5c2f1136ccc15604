//! Broker API client

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::types::{AccountState, BrokerDeal, BrokerOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// The three remote calls a synchronization cycle depends on.
///
/// A client is bound to a single broker account; implementations must be
/// safe to share between tasks.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// External broker account reference this client is bound to
    fn account_ref(&self) -> &str;

    /// Current balance/equity/margin state
    async fn account_state(&self) -> Result<AccountState, BrokerError>;

    /// Orders currently working on the broker side
    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    /// Deals closed at or after `since`, oldest first (all known deals when
    /// `None`), truncated to [`BrokerClient::page_limit`] entries
    async fn deals_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BrokerDeal>, BrokerError>;

    /// Largest number of deals one `deals_since` call returns; `None` when
    /// results are never truncated. A full page means more deals may remain.
    fn page_limit(&self) -> Option<usize> {
        None
    }
}

/// Response envelope used by every endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    message: Option<String>,
}

/// REST client for the StocksTrader broker API
#[derive(Debug)]
pub struct StocksTraderClient {
    config: BrokerConfig,
    client: reqwest::Client,
    account_ref: String,
    token: String,
}

impl StocksTraderClient {
    /// Create a client bound to `account_ref`, authenticating with `token`
    pub fn new(
        config: BrokerConfig,
        account_ref: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(BrokerError::Credentials { message: "empty API token".to_string() });
        }

        let client = reqwest::Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self { config, client, account_ref: account_ref.into(), token })
    }

    fn account_url(&self) -> String {
        format!("{}/accounts/{}", self.config.api_base_url.trim_end_matches('/'), self.account_ref)
    }

    /// GET `url` and return the unwrapped `data` payload
    async fn get_data(
        &self,
        operation: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, BrokerError> {
        tracing::debug!(operation, url, "Calling broker API");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BrokerError::Timeout {
                        operation: operation.to_string(),
                        timeout_ms: self.config.request_timeout_ms,
                    }
                } else {
                    BrokerError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = BrokerError::from_status(status.as_u16(), body);
            tracing::warn!(operation, status = status.as_u16(), "Broker API error: {}", err);
            return Err(err);
        }

        let text = response.text().await?;
        parse_envelope(operation, &text)
    }

    fn parse_list<T>(
        operation: &str,
        data: serde_json::Value,
        decode: impl Fn(&serde_json::Value) -> Result<T, BrokerError>,
    ) -> Result<Vec<T>, BrokerError> {
        match data {
            serde_json::Value::Null => Ok(Vec::new()),
            serde_json::Value::Array(items) => items.iter().map(decode).collect(),
            other => Err(BrokerError::Malformed {
                context: operation.to_string(),
                message: "expected array".to_string(),
                payload: Some(other.to_string()),
            }),
        }
    }
}

/// Unwrap the `{"code": "ok", "data": ...}` envelope
fn parse_envelope(operation: &str, text: &str) -> Result<serde_json::Value, BrokerError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| BrokerError::Malformed {
        context: operation.to_string(),
        message: e.to_string(),
        payload: Some(text.to_string()),
    })?;

    match envelope.code.as_deref() {
        None | Some("ok") => Ok(envelope.data),
        Some(code) => Err(BrokerError::BadRequest {
            message: format!(
                "{} returned code '{}': {}",
                operation,
                code,
                envelope.message.unwrap_or_default()
            ),
        }),
    }
}

#[async_trait]
impl BrokerClient for StocksTraderClient {
    fn account_ref(&self) -> &str {
        &self.account_ref
    }

    async fn account_state(&self) -> Result<AccountState, BrokerError> {
        let data = self.get_data("account_state", &self.account_url(), &[]).await?;
        AccountState::from_wire(&data)
    }

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let url = format!("{}/orders", self.account_url());
        let query = [("limit", self.config.page_limit.to_string())];
        let data = self.get_data("open_orders", &url, &query).await?;
        Self::parse_list("open_orders", data, BrokerOrder::from_wire)
    }

    async fn deals_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BrokerDeal>, BrokerError> {
        let url = format!("{}/deals", self.account_url());
        let mut query = vec![("limit", self.config.page_limit.to_string())];
        if let Some(since) = since {
            query.push(("from", since.timestamp_millis().to_string()));
        }

        let data = self.get_data("deals_since", &url, &query).await?;
        Self::parse_list("deals_since", data, BrokerDeal::from_wire)
    }

    fn page_limit(&self) -> Option<usize> {
        Some(self.config.page_limit as usize)
    }
}
