//! Telegram delivery of closed-deal notifications

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use sync_engine::{DealNotification, DealNotifier, SyncError};

use crate::config::TelegramConfig;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

/// Posts one Markdown message per newly closed deal to a Telegram chat
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// `None` unless both bot token and chat id are configured
    pub fn from_config(config: &TelegramConfig) -> anyhow::Result<Option<Self>> {
        let (Some(token), Some(chat_id)) = (&config.bot_token, &config.chat_id) else {
            return Ok(None);
        };

        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        let endpoint =
            format!("{}/bot{}/sendMessage", config.api_base_url.trim_end_matches('/'), token);

        Ok(Some(Self { client, endpoint, chat_id: chat_id.clone() }))
    }
}

/// Message body, e.g. "🔔 *New Trade Closed*\nSymbol: AAPL.US ..."
pub fn format_message(notification: &DealNotification) -> String {
    format!(
        "🔔 *New Trade Closed*\nSymbol: {}\nSide: {}\nProfit: {}",
        notification.ticker,
        notification.side.as_str().to_uppercase(),
        notification.profit
    )
}

#[async_trait]
impl DealNotifier for TelegramNotifier {
    async fn notify(&self, notification: &DealNotification) -> sync_engine::Result<()> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: format_message(notification),
            parse_mode: "Markdown",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Notification(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Notification(format!("Telegram returned {}: {}", status, text)));
        }

        tracing::debug!(
            account_id = notification.account_id,
            deal_id = %notification.deal_id,
            "Deal notification sent"
        );
        Ok(())
    }
}
