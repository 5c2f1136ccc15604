//! In-memory persistence gateway for tests and dry runs

use crate::error::{Result, SyncError};
use crate::gateway::PersistenceGateway;
use crate::model::{
    day_bounds, Account, AccountId, DailyStat, DailyTotals, Deal, Order, OrderUpsert, Position,
    Snapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    snapshots: Vec<Snapshot>,
    next_snapshot_id: i64,
    orders: HashMap<(AccountId, String), Order>,
    deals: HashMap<(AccountId, String), Deal>,
    positions: HashMap<AccountId, Vec<Position>>,
    daily_stats: HashMap<(AccountId, NaiveDate), DailyStat>,
}

/// Gateway keeping every table in process memory
#[derive(Default)]
pub struct MemoryGateway {
    tables: RwLock<Tables>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite an account
    pub async fn insert_account(&self, account: Account) {
        let mut tables = self.tables.write().await;
        tables.accounts.insert(account.id, account);
    }

    pub async fn set_active(&self, account_id: AccountId, active: bool) -> Result<()> {
        let mut tables = self.tables.write().await;
        let account =
            tables.accounts.get_mut(&account_id).ok_or(SyncError::AccountNotFound(account_id))?;
        account.is_active = active;
        Ok(())
    }

    /// Replace stored credential material, as an administrator would
    pub async fn set_api_token(&self, account_id: AccountId, token: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let account =
            tables.accounts.get_mut(&account_id).ok_or(SyncError::AccountNotFound(account_id))?;
        account.api_token = token.to_string();
        Ok(())
    }

    pub async fn deal_count(&self, account_id: AccountId) -> usize {
        let tables = self.tables.read().await;
        tables.deals.keys().filter(|(id, _)| *id == account_id).count()
    }

    pub async fn snapshot_count(&self, account_id: AccountId) -> usize {
        let tables = self.tables.read().await;
        tables.snapshots.iter().filter(|s| s.account_id == account_id).count()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn active_accounts(&self) -> Result<Vec<Account>> {
        let tables = self.tables.read().await;
        let mut accounts: Vec<Account> =
            tables.accounts.values().filter(|a| a.is_active).cloned().collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn account(&self, account_id: AccountId) -> Result<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables.accounts.get(&account_id).cloned())
    }

    async fn sync_cursor(&self, account_id: AccountId) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        tables
            .accounts
            .get(&account_id)
            .map(|a| a.last_synced_at)
            .ok_or(SyncError::AccountNotFound(account_id))
    }

    async fn advance_sync_cursor(&self, account_id: AccountId, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let account =
            tables.accounts.get_mut(&account_id).ok_or(SyncError::AccountNotFound(account_id))?;
        account.last_synced_at = Some(at);
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<Snapshot> {
        let mut tables = self.tables.write().await;
        tables.next_snapshot_id += 1;
        let stored = Snapshot { id: tables.next_snapshot_id, ..snapshot.clone() };
        tables.snapshots.push(stored.clone());
        Ok(stored)
    }

    async fn latest_snapshot(&self, account_id: AccountId) -> Result<Option<Snapshot>> {
        let tables = self.tables.read().await;
        Ok(tables
            .snapshots
            .iter()
            .filter(|s| s.account_id == account_id)
            .max_by_key(|s| (s.captured_at, s.id))
            .cloned())
    }

    async fn snapshots(&self, account_id: AccountId, limit: usize) -> Result<Vec<Snapshot>> {
        let tables = self.tables.read().await;
        let mut snapshots: Vec<Snapshot> =
            tables.snapshots.iter().filter(|s| s.account_id == account_id).cloned().collect();
        snapshots.sort_by(|a, b| (b.captured_at, b.id).cmp(&(a.captured_at, a.id)));
        snapshots.truncate(limit);
        Ok(snapshots)
    }

    async fn upsert_order(&self, order: &Order) -> Result<OrderUpsert> {
        let mut tables = self.tables.write().await;
        let key = (order.account_id, order.id.clone());
        match tables.orders.get_mut(&key) {
            Some(existing) => {
                existing.status = order.status.clone();
                existing.volume = order.volume;
                existing.last_modified = order.last_modified;
                Ok(OrderUpsert::Updated)
            }
            None => {
                tables.orders.insert(key, order.clone());
                Ok(OrderUpsert::Inserted)
            }
        }
    }

    async fn orders(&self, account_id: AccountId) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> =
            tables.orders.values().filter(|o| o.account_id == account_id).cloned().collect();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(orders)
    }

    async fn insert_deal_if_absent(&self, deal: &Deal) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let key = (deal.account_id, deal.id.clone());
        if tables.deals.contains_key(&key) {
            return Ok(false);
        }
        tables.deals.insert(key, deal.clone());
        Ok(true)
    }

    async fn deals(&self, account_id: AccountId, limit: usize) -> Result<Vec<Deal>> {
        let tables = self.tables.read().await;
        let mut deals: Vec<Deal> =
            tables.deals.values().filter(|d| d.account_id == account_id).cloned().collect();
        deals.sort_by(|a, b| (b.close_time, &b.id).cmp(&(a.close_time, &a.id)));
        deals.truncate(limit);
        Ok(deals)
    }

    async fn replace_positions(&self, account_id: AccountId, positions: &[Position]) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.positions.insert(account_id, positions.to_vec());
        Ok(())
    }

    async fn positions(&self, account_id: AccountId) -> Result<Vec<Position>> {
        let tables = self.tables.read().await;
        Ok(tables.positions.get(&account_id).cloned().unwrap_or_default())
    }

    async fn daily_totals(&self, account_id: AccountId, date: NaiveDate) -> Result<DailyTotals> {
        let (start, end) = day_bounds(date);
        let in_day = |t: DateTime<Utc>| t >= start && t < end;
        let tables = self.tables.read().await;

        let realized_pl = tables
            .deals
            .values()
            .filter(|d| d.account_id == account_id && d.status.is_closed())
            .filter(|d| d.close_time.map(in_day).unwrap_or(false))
            .fold(Decimal::ZERO, |acc, d| acc + d.profit);

        let equities: Vec<Decimal> = tables
            .snapshots
            .iter()
            .filter(|s| s.account_id == account_id && in_day(s.captured_at))
            .map(|s| s.equity)
            .collect();

        Ok(DailyTotals {
            realized_pl,
            peak_equity: equities.iter().copied().max(),
            trough_equity: equities.iter().copied().min(),
        })
    }

    async fn upsert_daily_stat(&self, stat: &DailyStat) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.daily_stats.insert((stat.account_id, stat.date), stat.clone());
        Ok(())
    }

    async fn daily_stat(&self, account_id: AccountId, date: NaiveDate) -> Result<Option<DailyStat>> {
        let tables = self.tables.read().await;
        Ok(tables.daily_stats.get(&(account_id, date)).cloned())
    }
}
