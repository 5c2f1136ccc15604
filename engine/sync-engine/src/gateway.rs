//! Persistence seam used by every engine component

use crate::error::Result;
use crate::model::{
    Account, AccountId, DailyStat, DailyTotals, Deal, Order, OrderUpsert, Position, Snapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

/// Transactional store behind the engine.
///
/// Row-level operations must be atomic: a deal insert either adds the row or
/// reports that it already existed, an order or daily stat write either
/// inserts or updates, and a position replacement is all-or-nothing.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    // Accounts

    async fn active_accounts(&self) -> Result<Vec<Account>>;

    async fn account(&self, account_id: AccountId) -> Result<Option<Account>>;

    /// Timestamp of the last fully successful cycle
    async fn sync_cursor(&self, account_id: AccountId) -> Result<Option<DateTime<Utc>>>;

    async fn advance_sync_cursor(&self, account_id: AccountId, at: DateTime<Utc>) -> Result<()>;

    // Snapshots

    /// Append a snapshot and return it with its assigned id
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<Snapshot>;

    async fn latest_snapshot(&self, account_id: AccountId) -> Result<Option<Snapshot>>;

    /// Most recent snapshots, newest first
    async fn snapshots(&self, account_id: AccountId, limit: usize) -> Result<Vec<Snapshot>>;

    // Orders

    async fn upsert_order(&self, order: &Order) -> Result<OrderUpsert>;

    async fn orders(&self, account_id: AccountId) -> Result<Vec<Order>>;

    // Deals

    /// Insert unless (account, id) is already recorded; `true` when a row was added
    async fn insert_deal_if_absent(&self, deal: &Deal) -> Result<bool>;

    /// Most recently closed deals, newest first
    async fn deals(&self, account_id: AccountId, limit: usize) -> Result<Vec<Deal>>;

    // Positions

    /// Replace the whole open-position set of an account
    async fn replace_positions(&self, account_id: AccountId, positions: &[Position]) -> Result<()>;

    async fn positions(&self, account_id: AccountId) -> Result<Vec<Position>>;

    // Daily statistics

    /// Closed-deal profit and snapshot equity extremes within `date` (UTC)
    async fn daily_totals(&self, account_id: AccountId, date: NaiveDate) -> Result<DailyTotals>;

    async fn upsert_daily_stat(&self, stat: &DailyStat) -> Result<()>;

    async fn daily_stat(&self, account_id: AccountId, date: NaiveDate) -> Result<Option<DailyStat>>;
}
