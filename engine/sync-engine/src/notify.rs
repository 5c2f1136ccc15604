//! Notification seam for newly closed deals

use crate::error::Result;
use crate::model::{AccountId, Deal};
use async_trait::async_trait;
use broker_client::TradeSide;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A deal observed as closed for the first time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealNotification {
    pub account_id: AccountId,
    pub deal_id: String,
    pub ticker: String,
    pub side: TradeSide,
    pub profit: Decimal,
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<&Deal> for DealNotification {
    fn from(deal: &Deal) -> Self {
        Self {
            account_id: deal.account_id,
            deal_id: deal.id.clone(),
            ticker: deal.ticker.clone(),
            side: deal.side,
            profit: deal.profit,
            closed_at: deal.close_time,
        }
    }
}

/// Receives one call per newly recorded closed deal.
///
/// Calls are made from a detached task; a slow or failing notifier never
/// delays the polling worker.
#[async_trait]
pub trait DealNotifier: Send + Sync {
    async fn notify(&self, notification: &DealNotification) -> Result<()>;
}

/// Notifier that only writes a log line
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl DealNotifier for LoggingNotifier {
    async fn notify(&self, notification: &DealNotification) -> Result<()> {
        tracing::info!(
            account_id = notification.account_id,
            deal_id = %notification.deal_id,
            ticker = %notification.ticker,
            side = %notification.side,
            profit = %notification.profit,
            "New trade closed"
        );
        Ok(())
    }
}
