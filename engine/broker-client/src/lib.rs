//! Broker Client - typed access to the remote brokerage API
//!
//! Exposes the three remote calls the synchronization engine depends on
//! (account state, open orders, deals since a timestamp) behind the
//! [`BrokerClient`] trait, normalizes broker payloads into typed values, and
//! classifies failures so callers can decide between suspending, aborting
//! and retrying.

pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod types;

pub use client::{BrokerClient, StocksTraderClient};
pub use config::BrokerConfig;
pub use connector::{
    BrokerConnector, BrokerCredentials, CredentialDecryptor, PassthroughDecryptor,
    StocksTraderConnector,
};
pub use error::{BrokerError, BrokerErrorKind};
pub use types::{AccountState, BrokerDeal, BrokerOrder, DealStatus, OrderStatus, TradeSide};

// Result type alias
pub type Result<T> = std::result::Result<T, BrokerError>;
