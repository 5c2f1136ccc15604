//! Normalized broker payloads
//!
//! The broker reports statuses and sides as free-form strings. They are
//! normalized here, at the adapter boundary, so the rest of the system never
//! compares raw vocabulary.

use crate::error::BrokerError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Margin/balance state of an account at the time of the call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub unrealized_pl: Decimal,
}

/// Trade side enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeSide {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "long" => Ok(TradeSide::Buy),
            "sell" | "short" => Ok(TradeSide::Sell),
            other => Err(BrokerError::malformed("side", format!("unknown trade side '{}'", other))),
        }
    }
}

/// Order status as reported by the broker, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderStatus(pub String);

impl OrderStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a deal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum DealStatus {
    /// Still running on the broker side; feeds the position set
    Open,
    /// Final; the only source of realized P/L
    Closed,
    /// Any other vocabulary the broker uses
    Other(String),
}

impl DealStatus {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "open" | "active" | "opened" => DealStatus::Open,
            "closed" | "close" => DealStatus::Closed,
            _ => DealStatus::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DealStatus::Open => "open",
            DealStatus::Closed => "closed",
            DealStatus::Other(s) => s,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, DealStatus::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, DealStatus::Closed)
    }
}

impl From<String> for DealStatus {
    fn from(value: String) -> Self {
        DealStatus::parse(&value)
    }
}

impl From<DealStatus> for String {
    fn from(value: DealStatus) -> Self {
        value.as_str().to_string()
    }
}

/// An open order as listed by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub ticker: String,
    pub side: TradeSide,
    pub order_type: String,
    pub volume: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub create_time: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

/// A deal (trade) as listed by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerDeal {
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

#[derive(Debug, Deserialize)]
struct WireMargin {
    balance: Decimal,
    equity: Decimal,
    #[serde(default)]
    margin: Decimal,
    #[serde(default)]
    free_margin: Decimal,
    #[serde(default, alias = "unrealized_pnl")]
    unrealized_pl: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    margin: WireMargin,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    ticker: String,
    side: String,
    #[serde(rename = "type", default)]
    order_type: Option<String>,
    volume: Decimal,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    create_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireDeal {
    ticker: String,
    side: String,
    volume: Decimal,
    #[serde(default)]
    open_price: Decimal,
    #[serde(default)]
    close_price: Option<Decimal>,
    #[serde(default)]
    open_time: Option<i64>,
    #[serde(default)]
    close_time: Option<i64>,
    #[serde(default)]
    profit: Decimal,
    status: String,
}

/// Broker timestamps are epoch milliseconds; zero means "not set"
fn millis_to_datetime(millis: Option<i64>) -> Option<DateTime<Utc>> {
    match millis {
        Some(ms) if ms > 0 => DateTime::from_timestamp_millis(ms),
        _ => None,
    }
}

fn id_from_value(value: &serde_json::Value, context: &str) -> Result<String, BrokerError> {
    match value.get("id") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(BrokerError::Malformed {
            context: context.to_string(),
            message: "missing id".to_string(),
            payload: Some(value.to_string()),
        }),
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    value: &serde_json::Value,
    context: &str,
) -> Result<T, BrokerError> {
    serde_json::from_value(value.clone()).map_err(|e| BrokerError::Malformed {
        context: context.to_string(),
        message: e.to_string(),
        payload: Some(value.to_string()),
    })
}

impl AccountState {
    /// Decode the `data` object of an account response
    pub fn from_wire(data: &serde_json::Value) -> Result<Self, BrokerError> {
        let account: WireAccount = decode(data, "account state")?;
        let margin = account.margin;
        // Older payloads omit unrealized P/L; it is the equity/balance gap there
        let unrealized_pl = margin.unrealized_pl.unwrap_or(margin.equity - margin.balance);

        Ok(Self {
            balance: margin.balance,
            equity: margin.equity,
            margin: margin.margin,
            free_margin: margin.free_margin,
            unrealized_pl,
        })
    }
}

impl BrokerOrder {
    pub fn from_wire(value: &serde_json::Value) -> Result<Self, BrokerError> {
        let id = id_from_value(value, "order")?;
        let wire: WireOrder = decode(value, "order")?;

        Ok(Self {
            id,
            ticker: wire.ticker,
            side: wire.side.parse()?,
            order_type: wire.order_type.unwrap_or_else(|| "market".to_string()),
            volume: wire.volume,
            price: wire.price,
            status: OrderStatus::new(wire.status.unwrap_or_else(|| "active".to_string())),
            create_time: millis_to_datetime(wire.create_time),
            raw: value.clone(),
        })
    }
}

impl BrokerDeal {
    pub fn from_wire(value: &serde_json::Value) -> Result<Self, BrokerError> {
        let id = id_from_value(value, "deal")?;
        let wire: WireDeal = decode(value, "deal")?;
        let close_price = wire.close_price.filter(|p| !p.is_zero());

        Ok(Self {
            id,
            ticker: wire.ticker,
            side: wire.side.parse()?,
            volume: wire.volume,
            open_price: wire.open_price,
            close_price,
            open_time: millis_to_datetime(wire.open_time),
            close_time: millis_to_datetime(wire.close_time),
            profit: wire.profit,
            status: DealStatus::parse(&wire.status),
            raw: value.clone(),
        })
    }
}
