//! One synchronization cycle of one account

use crate::aggregate::DailyStatsAggregator;
use crate::broadcast::{BroadcastHub, MarketUpdate, StreamMessage};
use crate::error::{bounded, bounded_broker, Result};
use crate::gateway::PersistenceGateway;
use crate::metrics::SyncMetrics;
use crate::model::{AccountId, Order};
use crate::notify::{DealNotification, DealNotifier};
use crate::reconcile::{CycleFetch, Reconciler};
use broker_client::BrokerClient;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-account in-flight flag.
///
/// At most one [`CycleToken`] exists per guard; a cycle that cannot obtain
/// one is skipped rather than queued.
#[derive(Debug, Clone, Default)]
pub struct CycleGuard {
    in_flight: Arc<AtomicBool>,
}

/// Held for the duration of a cycle; releases the guard on drop
#[derive(Debug)]
pub struct CycleToken {
    in_flight: Arc<AtomicBool>,
}

impl CycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<CycleToken> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleToken { in_flight: self.in_flight.clone() })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for CycleToken {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Result of a completed cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub account_id: AccountId,
    pub started_at: DateTime<Utc>,
    pub snapshot_id: i64,
    pub equity: Decimal,
    pub orders_upserted: usize,
    pub orders_failed: usize,
    pub new_deals: usize,
    pub deals_failed: usize,
    pub positions: usize,
    pub cursor_advanced: bool,
    pub deliveries: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    Completed(CycleSummary),
    /// Another cycle of the same account was still in flight
    Skipped,
}

/// Components a cycle needs, shared by all workers
pub(crate) struct CycleDeps {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub reconciler: Reconciler,
    pub aggregator: DailyStatsAggregator,
    pub hub: Arc<BroadcastHub>,
    pub notifier: Option<Arc<dyn DealNotifier>>,
    pub metrics: Arc<SyncMetrics>,
    pub io_timeout: Duration,
}

impl CycleDeps {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        hub: Arc<BroadcastHub>,
        notifier: Option<Arc<dyn DealNotifier>>,
        metrics: Arc<SyncMetrics>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(gateway.clone(), io_timeout),
            aggregator: DailyStatsAggregator::new(gateway.clone(), io_timeout),
            gateway,
            hub,
            notifier,
            metrics,
            io_timeout,
        }
    }
}

/// Binds an account to its broker client and the shared components.
///
/// Every cycle built for one account must share that account's
/// [`CycleGuard`].
#[derive(Clone)]
pub struct SyncCycle {
    account_id: AccountId,
    client: Arc<dyn BrokerClient>,
    deps: Arc<CycleDeps>,
    guard: CycleGuard,
}

impl SyncCycle {
    pub(crate) fn new(
        account_id: AccountId,
        client: Arc<dyn BrokerClient>,
        deps: Arc<CycleDeps>,
        guard: CycleGuard,
    ) -> Self {
        Self { account_id, client, deps, guard }
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn guard(&self) -> &CycleGuard {
        &self.guard
    }

    /// Run one cycle unless one is already in flight
    pub async fn run(&self) -> Result<CycleReport> {
        let Some(_token) = self.guard.try_begin() else {
            self.deps.metrics.cycles_skipped.inc();
            tracing::debug!(account_id = self.account_id, "Previous cycle still running, skipping");
            return Ok(CycleReport::Skipped);
        };

        match self.execute().await {
            Ok(summary) => {
                self.deps.metrics.cycles_completed.inc();
                Ok(CycleReport::Completed(summary))
            }
            Err(e) => {
                self.deps.metrics.cycles_failed.inc();
                Err(e)
            }
        }
    }

    /// Where the deals cursor moves after a clean cycle.
    ///
    /// A full page may hide older deals, so the cursor only reaches the newest
    /// close time actually received; otherwise it moves to the cycle start.
    fn next_cursor(
        &self,
        cursor: Option<DateTime<Utc>>,
        fetch: &CycleFetch,
        started_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let page_full = self.client.page_limit().is_some_and(|limit| fetch.deals.len() >= limit);
        if !page_full {
            return Some(started_at);
        }

        let newest = fetch
            .deals
            .iter()
            .filter(|d| d.status.is_closed())
            .filter_map(|d| d.close_time)
            .max()
            .map(|newest| newest.min(started_at));
        match newest {
            Some(newest) if cursor.map_or(true, |current| newest > current) => {
                tracing::debug!(account_id = self.account_id, cursor = %newest, "Deal page full, paging by close time");
                Some(newest)
            }
            _ => {
                tracing::warn!(
                    account_id = self.account_id,
                    deals = fetch.deals.len(),
                    "Deal page full without a later close time, keeping sync cursor"
                );
                None
            }
        }
    }

    async fn execute(&self) -> Result<CycleSummary> {
        let account_id = self.account_id;
        let deps = &self.deps;
        let timeout = deps.io_timeout;
        let started_at = Utc::now();

        let cursor = bounded("sync_cursor", timeout, deps.gateway.sync_cursor(account_id)).await?;

        let state = bounded_broker("account_state", timeout, self.client.account_state()).await?;
        let orders = bounded_broker("open_orders", timeout, self.client.open_orders()).await?;
        let deals = bounded_broker("deals_since", timeout, self.client.deals_since(cursor)).await?;
        let fetch = CycleFetch { state, orders, deals };

        let outcome = deps.reconciler.reconcile(account_id, &fetch).await?;

        deps.metrics.deals_ingested.add(outcome.new_deals.len() as u64);
        deps.metrics.orders_failed.add(outcome.orders_failed as u64);
        deps.metrics.deals_failed.add(outcome.deals_failed as u64);

        // Today's row, plus any earlier day a newly recorded deal closed on
        let mut dates: BTreeSet<NaiveDate> = BTreeSet::new();
        dates.insert(outcome.snapshot.captured_at.date_naive());
        dates.extend(outcome.new_deals.iter().filter_map(|d| d.close_time).map(|t| t.date_naive()));
        for date in dates {
            if let Err(e) = deps.aggregator.recompute(account_id, date).await {
                tracing::warn!(account_id, %date, "Failed to update daily stat: {}", e);
            }
        }

        let cursor_advanced = if outcome.deals_failed > 0 {
            tracing::warn!(
                account_id,
                deals_failed = outcome.deals_failed,
                "Keeping sync cursor so failed deals are fetched again"
            );
            false
        } else if let Some(next) = self.next_cursor(cursor, &fetch, started_at) {
            match bounded(
                "advance_sync_cursor",
                timeout,
                deps.gateway.advance_sync_cursor(account_id, next),
            )
            .await
            {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(account_id, "Failed to advance sync cursor: {}", e);
                    false
                }
            }
        } else {
            false
        };

        let open_orders: Vec<Order> =
            fetch.orders.iter().map(|o| Order::from_broker(account_id, o, started_at)).collect();
        let market = StreamMessage::Market(MarketUpdate {
            equity: outcome.snapshot.equity,
            balance: outcome.snapshot.balance,
            margin: outcome.snapshot.margin,
            free_margin: outcome.snapshot.free_margin,
            open_orders,
            positions: outcome.positions.clone(),
            timestamp: outcome.snapshot.captured_at,
        });
        let mut deliveries = deps.hub.publish(account_id, market).await;
        for deal in &outcome.new_deals {
            deliveries += deps.hub.publish(account_id, StreamMessage::DealClosed(deal.clone())).await;
        }
        deps.metrics.broadcasts_delivered.add(deliveries as u64);

        if let Some(notifier) = &deps.notifier {
            for deal in &outcome.new_deals {
                let notifier = notifier.clone();
                let notification = DealNotification::from(deal);
                tokio::spawn(async move {
                    if let Err(e) = notifier.notify(&notification).await {
                        tracing::warn!(
                            account_id = notification.account_id,
                            deal_id = %notification.deal_id,
                            "Deal notification failed: {}",
                            e
                        );
                    }
                });
            }
        }

        if !outcome.new_deals.is_empty() {
            tracing::info!(account_id, new_deals = outcome.new_deals.len(), "Recorded new closed deals");
        }

        Ok(CycleSummary {
            account_id,
            started_at,
            snapshot_id: outcome.snapshot.id,
            equity: outcome.snapshot.equity,
            orders_upserted: outcome.orders_upserted,
            orders_failed: outcome.orders_failed,
            new_deals: outcome.new_deals.len(),
            deals_failed: outcome.deals_failed,
            positions: outcome.positions.len(),
            cursor_advanced,
            deliveries,
        })
    }
}
