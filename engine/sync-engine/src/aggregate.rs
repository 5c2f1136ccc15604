//! Daily statistics derived from recorded deals and snapshots

use crate::error::{bounded, Result};
use crate::gateway::PersistenceGateway;
use crate::model::{AccountId, DailyStat};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Recomputes the (account, UTC date) statistic from persisted rows.
///
/// The result depends only on what is stored for that date, so running it
/// any number of times yields the same row.
pub struct DailyStatsAggregator {
    gateway: Arc<dyn PersistenceGateway>,
    io_timeout: Duration,
}

impl DailyStatsAggregator {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, io_timeout: Duration) -> Self {
        Self { gateway, io_timeout }
    }

    pub async fn recompute(&self, account_id: AccountId, date: NaiveDate) -> Result<DailyStat> {
        let totals =
            bounded("daily_totals", self.io_timeout, self.gateway.daily_totals(account_id, date))
                .await?;
        let stat = DailyStat::from_totals(account_id, date, &totals);

        bounded("upsert_daily_stat", self.io_timeout, self.gateway.upsert_daily_stat(&stat)).await?;

        tracing::debug!(
            account_id,
            %date,
            realized_pl = %stat.realized_pl,
            max_drawdown = %stat.max_drawdown,
            "Daily stat updated"
        );
        Ok(stat)
    }

    pub async fn recompute_today(&self, account_id: AccountId) -> Result<DailyStat> {
        self.recompute(account_id, Utc::now().date_naive()).await
    }
}
