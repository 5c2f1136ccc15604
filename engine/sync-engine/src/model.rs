//! Persisted records of a mirrored account

use broker_client::{
    AccountState, BrokerCredentials, BrokerDeal, BrokerOrder, DealStatus, OrderStatus, TradeSide,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Local identifier of a mirrored account
pub type AccountId = i64;

/// A brokerage account tracked by this system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub external_account_id: String,
    pub name: Option<String>,
    /// Stored credential material, opaque to the engine
    #[serde(skip_serializing)]
    pub api_token: String,
    pub is_active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn credentials(&self) -> BrokerCredentials {
        BrokerCredentials {
            account_ref: self.external_account_id.clone(),
            api_token: self.api_token.clone(),
        }
    }
}

/// Point-in-time financial state of an account; never updated once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Assigned by the store on insert
    pub id: i64,
    pub account_id: AccountId,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub unrealized_pl: Decimal,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn from_state(account_id: AccountId, state: &AccountState, captured_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            account_id,
            balance: state.balance,
            equity: state.equity,
            margin: state.margin,
            free_margin: state.free_margin,
            unrealized_pl: state.unrealized_pl,
            captured_at,
        }
    }
}

/// An order mirrored from the broker, keyed by (account, external id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub account_id: AccountId,
    pub id: String,
    pub ticker: String,
    pub side: TradeSide,
    pub order_type: String,
    pub volume: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub create_time: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
    pub last_modified: DateTime<Utc>,
}

impl Order {
    pub fn from_broker(account_id: AccountId, order: &BrokerOrder, observed_at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            id: order.id.clone(),
            ticker: order.ticker.clone(),
            side: order.side,
            order_type: order.order_type.clone(),
            volume: order.volume,
            price: order.price,
            status: order.status.clone(),
            create_time: order.create_time,
            raw: order.raw.clone(),
            last_modified: observed_at,
        }
    }
}

/// A recorded deal, immutable once inserted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub account_id: AccountId,
    pub id: String,
    pub ticker: String,
    pub side: TradeSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub close_price: Option<Decimal>,
    pub open_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub profit: Decimal,
    pub status: DealStatus,
    pub raw: serde_json::Value,
}

impl Deal {
    pub fn from_broker(account_id: AccountId, deal: &BrokerDeal) -> Self {
        Self {
            account_id,
            id: deal.id.clone(),
            ticker: deal.ticker.clone(),
            side: deal.side,
            volume: deal.volume,
            open_price: deal.open_price,
            close_price: deal.close_price,
            open_time: deal.open_time,
            close_time: deal.close_time,
            profit: deal.profit,
            status: deal.status.clone(),
            raw: deal.raw.clone(),
        }
    }
}

/// One currently open trade; the whole set is replaced every cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account_id: AccountId,
    pub deal_id: String,
    pub ticker: String,
    pub side: TradeSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub open_time: Option<DateTime<Utc>>,
    /// Floating profit as reported at fetch time
    pub profit: Decimal,
}

impl Position {
    pub fn from_open_deal(account_id: AccountId, deal: &BrokerDeal) -> Self {
        Self {
            account_id,
            deal_id: deal.id.clone(),
            ticker: deal.ticker.clone(),
            side: deal.side,
            volume: deal.volume,
            open_price: deal.open_price,
            open_time: deal.open_time,
            profit: deal.profit,
        }
    }
}

/// Raw per-day aggregates read from the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyTotals {
    pub realized_pl: Decimal,
    pub peak_equity: Option<Decimal>,
    pub trough_equity: Option<Decimal>,
}

/// Realized P/L and intraday drawdown for one (account, UTC date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub realized_pl: Decimal,
    pub peak_equity: Decimal,
    pub max_drawdown: Decimal,
}

impl DailyStat {
    pub fn from_totals(account_id: AccountId, date: NaiveDate, totals: &DailyTotals) -> Self {
        let peak_equity = totals.peak_equity.unwrap_or(Decimal::ZERO);
        let max_drawdown = match (totals.peak_equity, totals.trough_equity) {
            (Some(peak), Some(trough)) => (peak - trough).max(Decimal::ZERO),
            _ => Decimal::ZERO,
        };

        Self { account_id, date, realized_pl: totals.realized_pl, peak_equity, max_drawdown }
    }
}

/// Result of an order upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderUpsert {
    Inserted,
    Updated,
}

/// Half-open UTC range `[start, end)` covering `date`
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}
