//! Sync Engine - Account synchronization and broadcast
//!
//! Mirrors a brokerage account's live state into a local store and streams
//! updates to subscribed listeners. Each active account is polled by its own
//! worker; every cycle fetches the account state, open orders and recent
//! deals, reconciles them into persisted history without duplication,
//! refreshes the day's statistics, then fans the results out.
//!
//! Key components:
//! - [`SyncScheduler`]: one non-reentrant polling worker per account
//! - [`Reconciler`]: merges a fetch into snapshots, orders, deals and positions
//! - [`DailyStatsAggregator`]: realized P/L and intraday drawdown per day
//! - [`BroadcastHub`]: per-account, per-kind fan-out to live listeners
//! - [`PersistenceGateway`]: storage seam with PostgreSQL and in-memory backends

pub mod aggregate;
pub mod broadcast;
pub mod config;
pub mod cycle;
pub mod error;
pub mod gateway;
pub mod memory_gateway;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod pg_gateway;
pub mod reconcile;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregate::DailyStatsAggregator;
pub use broadcast::{
    BroadcastHub, CatchUpUpdate, DeliveryError, ListenerId, MarketUpdate, MessageKind,
    StreamEnvelope, StreamMessage, UpdateSink,
};
pub use config::SyncConfig;
pub use cycle::{CycleGuard, CycleReport, CycleSummary, SyncCycle};
pub use error::{Result, SyncError};
pub use gateway::PersistenceGateway;
pub use memory_gateway::MemoryGateway;
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use model::{
    Account, AccountId, DailyStat, DailyTotals, Deal, Order, OrderUpsert, Position, Snapshot,
};
pub use notify::{DealNotification, DealNotifier, LoggingNotifier};
pub use pg_gateway::PgGateway;
pub use reconcile::{CycleFetch, ReconcileOutcome, Reconciler};
pub use scheduler::{SyncScheduler, WorkerStatus};

/// Default interval between two cycles of the same account
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default bound for a single broker or persistence call
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 10_000;

/// Default buffer of channel listeners created through the hub
pub const DEFAULT_LISTENER_BUFFER: usize = 256;
