//! Fakes and fixtures shared by the unit tests

use crate::error::{Result, SyncError};
use crate::gateway::PersistenceGateway;
use crate::memory_gateway::MemoryGateway;
use crate::model::{
    Account, AccountId, DailyStat, DailyTotals, Deal, Order, OrderUpsert, Position, Snapshot,
};
use crate::notify::{DealNotification, DealNotifier};
use crate::reconcile::CycleFetch;
use async_trait::async_trait;
use broker_client::{
    AccountState, BrokerClient, BrokerConnector, BrokerCredentials, BrokerDeal, BrokerError,
    BrokerOrder, DealStatus, OrderStatus, TradeSide,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn dec(value: &str) -> Decimal {
    value.parse().unwrap()
}

pub fn account(id: AccountId) -> Account {
    Account {
        id,
        external_account_id: format!("ext-{}", id),
        name: Some(format!("Account {}", id)),
        api_token: format!("token-{}", id),
        is_active: true,
        last_synced_at: None,
    }
}

pub fn state(equity: &str) -> AccountState {
    AccountState {
        balance: dec(equity),
        equity: dec(equity),
        margin: Decimal::ZERO,
        free_margin: dec(equity),
        unrealized_pl: Decimal::ZERO,
    }
}

pub fn order(id: &str, status: &str, volume: &str) -> BrokerOrder {
    BrokerOrder {
        id: id.to_string(),
        ticker: "AAPL.US".to_string(),
        side: TradeSide::Buy,
        order_type: "limit".to_string(),
        volume: dec(volume),
        price: Some(dec("180.5")),
        status: OrderStatus::new(status),
        create_time: None,
        raw: serde_json::json!({ "id": id }),
    }
}

fn deal(id: &str, status: DealStatus, profit: &str, close_ms: Option<i64>) -> BrokerDeal {
    BrokerDeal {
        id: id.to_string(),
        ticker: "TSLA.US".to_string(),
        side: TradeSide::Sell,
        volume: Decimal::ONE,
        open_price: dec("250"),
        close_price: close_ms.map(|_| dec("245")),
        open_time: None,
        close_time: close_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        profit: dec(profit),
        status,
        raw: serde_json::json!({ "id": id }),
    }
}

pub fn closed_deal(id: &str, profit: &str, close_ms: i64) -> BrokerDeal {
    deal(id, DealStatus::Closed, profit, Some(close_ms))
}

pub fn open_deal(id: &str) -> BrokerDeal {
    deal(id, DealStatus::Open, "1.5", None)
}

pub fn other_deal(id: &str, status: &str) -> BrokerDeal {
    deal(id, DealStatus::parse(status), "0", None)
}

pub fn fetch(equity: &str, orders: Vec<BrokerOrder>, deals: Vec<BrokerDeal>) -> CycleFetch {
    CycleFetch { state: state(equity), orders, deals }
}

pub fn snapshot_at(account_id: AccountId, equity: &str, at: DateTime<Utc>) -> Snapshot {
    Snapshot::from_state(account_id, &state(equity), at)
}

#[derive(Default)]
struct Script {
    equity: Option<Decimal>,
    orders: Vec<BrokerOrder>,
    deals: Vec<BrokerDeal>,
    delay: Duration,
    failure_status: Option<u16>,
    page_limit: Option<usize>,
}

/// Broker fake with scripted responses and concurrency tracking
pub struct ScriptedBroker {
    account_ref: String,
    script: Mutex<Script>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    since_args: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl ScriptedBroker {
    pub fn new(account_ref: &str) -> Arc<Self> {
        Arc::new(Self {
            account_ref: account_ref.to_string(),
            script: Mutex::new(Script::default()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            since_args: Mutex::new(Vec::new()),
        })
    }

    pub fn set_equity(&self, equity: &str) {
        self.script.lock().equity = Some(dec(equity));
    }

    pub fn set_orders(&self, orders: Vec<BrokerOrder>) {
        self.script.lock().orders = orders;
    }

    pub fn set_deals(&self, deals: Vec<BrokerDeal>) {
        self.script.lock().deals = deals;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().delay = delay;
    }

    /// Serve deals like a paged API: closed at or after `since`, oldest
    /// first, at most `limit` per call
    pub fn set_page_limit(&self, limit: usize) {
        self.script.lock().page_limit = Some(limit);
    }

    /// Make `account_state` fail with an HTTP status, or succeed again with `None`
    pub fn fail_with_status(&self, status: Option<u16>) {
        self.script.lock().failure_status = status;
    }

    /// Number of cycles that reached the broker
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn since_args(&self) -> Vec<Option<DateTime<Utc>>> {
        self.since_args.lock().clone()
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    fn account_ref(&self) -> &str {
        &self.account_ref
    }

    async fn account_state(&self) -> std::result::Result<AccountState, BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self.script.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let script = self.script.lock();
        if let Some(status) = script.failure_status {
            return Err(BrokerError::from_status(status, "scripted failure".to_string()));
        }
        let equity = script.equity.unwrap_or_else(|| dec("1000"));
        Ok(AccountState {
            balance: equity,
            equity,
            margin: Decimal::ZERO,
            free_margin: equity,
            unrealized_pl: Decimal::ZERO,
        })
    }

    async fn open_orders(&self) -> std::result::Result<Vec<BrokerOrder>, BrokerError> {
        Ok(self.script.lock().orders.clone())
    }

    async fn deals_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> std::result::Result<Vec<BrokerDeal>, BrokerError> {
        self.since_args.lock().push(since);
        let script = self.script.lock();
        let Some(limit) = script.page_limit else {
            return Ok(script.deals.clone());
        };

        let mut page: Vec<BrokerDeal> = script
            .deals
            .iter()
            .filter(|d| match (since, d.close_time) {
                (Some(since), Some(closed)) => closed >= since,
                _ => true,
            })
            .cloned()
            .collect();
        page.sort_by_key(|d| d.close_time);
        page.truncate(limit);
        Ok(page)
    }

    fn page_limit(&self) -> Option<usize> {
        self.script.lock().page_limit
    }
}

/// Connector handing out pre-registered scripted brokers
#[derive(Default)]
pub struct ScriptedConnector {
    brokers: Mutex<HashMap<String, Arc<ScriptedBroker>>>,
    rejected_tokens: Mutex<HashSet<String>>,
    tokens_seen: Mutex<Vec<String>>,
    connect_delay: Mutex<Duration>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, account: &Account) -> Arc<ScriptedBroker> {
        let broker = ScriptedBroker::new(&account.external_account_id);
        self.brokers.lock().insert(account.external_account_id.clone(), broker.clone());
        broker
    }

    pub fn reject_token(&self, token: &str) {
        self.rejected_tokens.lock().insert(token.to_string());
    }

    /// Block inside `connect`, like a client doing slow setup work
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().clone()
    }
}

impl BrokerConnector for ScriptedConnector {
    fn connect(
        &self,
        credentials: &BrokerCredentials,
    ) -> std::result::Result<Arc<dyn BrokerClient>, BrokerError> {
        self.tokens_seen.lock().push(credentials.api_token.clone());
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.rejected_tokens.lock().contains(&credentials.api_token) {
            return Err(BrokerError::Credentials { message: "token rejected".to_string() });
        }
        let broker = self.brokers.lock().get(&credentials.account_ref).cloned().ok_or_else(|| {
            BrokerError::Credentials { message: format!("unknown account {}", credentials.account_ref) }
        })?;
        Ok(broker as Arc<dyn BrokerClient>)
    }
}

/// Gateway wrapper injecting write failures
pub struct FaultyGateway {
    inner: MemoryGateway,
    fail_snapshots: AtomicBool,
    fail_cursor: AtomicBool,
    failing_deals: Mutex<HashSet<String>>,
    read_delay: Mutex<Duration>,
}

impl FaultyGateway {
    pub fn new(inner: MemoryGateway) -> Self {
        Self {
            inner,
            fail_snapshots: AtomicBool::new(false),
            fail_cursor: AtomicBool::new(false),
            failing_deals: Mutex::new(HashSet::new()),
            read_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Slow down `latest_snapshot`
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    pub fn inner(&self) -> &MemoryGateway {
        &self.inner
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cursor(&self, fail: bool) {
        self.fail_cursor.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deal(&self, deal_id: &str) {
        self.failing_deals.lock().insert(deal_id.to_string());
    }

    pub fn heal_deals(&self) {
        self.failing_deals.lock().clear();
    }
}

#[async_trait]
impl PersistenceGateway for FaultyGateway {
    async fn active_accounts(&self) -> Result<Vec<Account>> {
        self.inner.active_accounts().await
    }

    async fn account(&self, account_id: AccountId) -> Result<Option<Account>> {
        self.inner.account(account_id).await
    }

    async fn sync_cursor(&self, account_id: AccountId) -> Result<Option<DateTime<Utc>>> {
        self.inner.sync_cursor(account_id).await
    }

    async fn advance_sync_cursor(&self, account_id: AccountId, at: DateTime<Utc>) -> Result<()> {
        if self.fail_cursor.load(Ordering::SeqCst) {
            return Err(SyncError::Internal("cursor write failed".to_string()));
        }
        self.inner.advance_sync_cursor(account_id, at).await
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<Snapshot> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(SyncError::Internal("snapshot write failed".to_string()));
        }
        self.inner.insert_snapshot(snapshot).await
    }

    async fn latest_snapshot(&self, account_id: AccountId) -> Result<Option<Snapshot>> {
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.latest_snapshot(account_id).await
    }

    async fn snapshots(&self, account_id: AccountId, limit: usize) -> Result<Vec<Snapshot>> {
        self.inner.snapshots(account_id, limit).await
    }

    async fn upsert_order(&self, order: &Order) -> Result<OrderUpsert> {
        self.inner.upsert_order(order).await
    }

    async fn orders(&self, account_id: AccountId) -> Result<Vec<Order>> {
        self.inner.orders(account_id).await
    }

    async fn insert_deal_if_absent(&self, deal: &Deal) -> Result<bool> {
        if self.failing_deals.lock().contains(&deal.id) {
            return Err(SyncError::Internal(format!("deal {} write failed", deal.id)));
        }
        self.inner.insert_deal_if_absent(deal).await
    }

    async fn deals(&self, account_id: AccountId, limit: usize) -> Result<Vec<Deal>> {
        self.inner.deals(account_id, limit).await
    }

    async fn replace_positions(&self, account_id: AccountId, positions: &[Position]) -> Result<()> {
        self.inner.replace_positions(account_id, positions).await
    }

    async fn positions(&self, account_id: AccountId) -> Result<Vec<Position>> {
        self.inner.positions(account_id).await
    }

    async fn daily_totals(&self, account_id: AccountId, date: NaiveDate) -> Result<DailyTotals> {
        self.inner.daily_totals(account_id, date).await
    }

    async fn upsert_daily_stat(&self, stat: &DailyStat) -> Result<()> {
        self.inner.upsert_daily_stat(stat).await
    }

    async fn daily_stat(&self, account_id: AccountId, date: NaiveDate) -> Result<Option<DailyStat>> {
        self.inner.daily_stat(account_id, date).await
    }
}

/// Notifier that records every call
#[derive(Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<DealNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<DealNotification> {
        self.received.lock().clone()
    }

    /// Wait until at least `count` notifications arrived
    pub async fn wait_for(&self, count: usize) -> Vec<DealNotification> {
        for _ in 0..1000 {
            if self.received.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        self.received()
    }
}

#[async_trait]
impl DealNotifier for RecordingNotifier {
    async fn notify(&self, notification: &DealNotification) -> Result<()> {
        self.received.lock().push(notification.clone());
        Ok(())
    }
}
