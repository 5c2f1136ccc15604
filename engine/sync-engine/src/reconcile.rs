//! Merging a broker fetch into persisted history
//!
//! Every reconciliation appends exactly one snapshot. Orders are upserted and
//! deals inserted only when absent, so feeding the same fetch twice never
//! duplicates rows nor reports a deal as new twice. The open-position set is
//! replaced wholesale from the open deals of the fetch.

use crate::error::{bounded, Result};
use crate::gateway::PersistenceGateway;
use crate::model::{AccountId, Deal, Order, Position, Snapshot};
use broker_client::{AccountState, BrokerDeal, BrokerOrder, DealStatus};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Everything fetched from the broker during one cycle
#[derive(Debug, Clone)]
pub struct CycleFetch {
    pub state: AccountState,
    pub orders: Vec<BrokerOrder>,
    pub deals: Vec<BrokerDeal>,
}

/// What a reconciliation changed
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub snapshot: Snapshot,
    /// Closed deals recorded for the first time, in fetch order
    pub new_deals: Vec<Deal>,
    pub orders_upserted: usize,
    pub orders_failed: usize,
    pub deals_failed: usize,
    pub positions: Vec<Position>,
    pub positions_replaced: bool,
}

impl ReconcileOutcome {
    /// No row-level write failed
    pub fn is_clean(&self) -> bool {
        self.orders_failed == 0 && self.deals_failed == 0 && self.positions_replaced
    }
}

pub struct Reconciler {
    gateway: Arc<dyn PersistenceGateway>,
    io_timeout: Duration,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, io_timeout: Duration) -> Self {
        Self { gateway, io_timeout }
    }

    pub async fn reconcile(&self, account_id: AccountId, fetch: &CycleFetch) -> Result<ReconcileOutcome> {
        self.reconcile_at(account_id, fetch, Utc::now()).await
    }

    /// Reconcile with an explicit capture instant
    pub async fn reconcile_at(
        &self,
        account_id: AccountId,
        fetch: &CycleFetch,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        // The snapshot is the one write a cycle cannot do without
        let snapshot = Snapshot::from_state(account_id, &fetch.state, now);
        let snapshot =
            bounded("insert_snapshot", self.io_timeout, self.gateway.insert_snapshot(&snapshot))
                .await?;

        let mut orders_upserted = 0;
        let mut orders_failed = 0;
        for broker_order in &fetch.orders {
            let order = Order::from_broker(account_id, broker_order, now);
            match bounded("upsert_order", self.io_timeout, self.gateway.upsert_order(&order)).await {
                Ok(_) => orders_upserted += 1,
                Err(e) => {
                    orders_failed += 1;
                    tracing::warn!(account_id, order_id = %order.id, "Failed to upsert order: {}", e);
                }
            }
        }

        let mut new_deals = Vec::new();
        let mut deals_failed = 0;
        let mut positions = Vec::new();
        let mut positioned = HashSet::new();
        for broker_deal in &fetch.deals {
            match &broker_deal.status {
                DealStatus::Closed => {
                    let deal = Deal::from_broker(account_id, broker_deal);
                    match bounded(
                        "insert_deal",
                        self.io_timeout,
                        self.gateway.insert_deal_if_absent(&deal),
                    )
                    .await
                    {
                        Ok(true) => new_deals.push(deal),
                        Ok(false) => {}
                        Err(e) => {
                            deals_failed += 1;
                            tracing::warn!(account_id, deal_id = %deal.id, "Failed to record deal: {}", e);
                        }
                    }
                }
                DealStatus::Open => {
                    if positioned.insert(broker_deal.id.as_str()) {
                        positions.push(Position::from_open_deal(account_id, broker_deal));
                    }
                }
                DealStatus::Other(status) => {
                    tracing::debug!(account_id, deal_id = %broker_deal.id, status = %status, "Skipping deal in non-final state");
                }
            }
        }

        let positions_replaced = match bounded(
            "replace_positions",
            self.io_timeout,
            self.gateway.replace_positions(account_id, &positions),
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(account_id, "Failed to replace positions: {}", e);
                false
            }
        };

        tracing::debug!(
            account_id,
            orders_upserted,
            orders_failed,
            new_deals = new_deals.len(),
            deals_failed,
            positions = positions.len(),
            "Reconciled cycle fetch"
        );

        Ok(ReconcileOutcome {
            snapshot,
            new_deals,
            orders_upserted,
            orders_failed,
            deals_failed,
            positions,
            positions_replaced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_gateway::MemoryGateway;
    use crate::testing::{closed_deal, fetch, open_deal, order, other_deal, FaultyGateway};
    use rust_decimal::Decimal;

    fn reconciler(gateway: Arc<dyn PersistenceGateway>) -> Reconciler {
        Reconciler::new(gateway, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_same_fetch_twice_is_idempotent() {
        let gateway = Arc::new(MemoryGateway::new());
        let reconciler = reconciler(gateway.clone());
        let input = fetch(
            "1000",
            vec![order("o1", "pending", "1")],
            vec![closed_deal("d1", "10", 1_700_000_000_000), closed_deal("d2", "-4", 1_700_000_100_000)],
        );

        let first = reconciler.reconcile(1, &input).await.unwrap();
        assert_eq!(first.new_deals.len(), 2);
        assert_eq!(first.orders_upserted, 1);

        let second = reconciler.reconcile(1, &input).await.unwrap();
        assert!(second.new_deals.is_empty());
        assert_eq!(gateway.deal_count(1).await, 2);
        assert_eq!(gateway.orders(1).await.unwrap().len(), 1);
        assert_eq!(gateway.snapshot_count(1).await, 2);
    }

    #[tokio::test]
    async fn test_overlapping_fetches_report_only_unseen_deals() {
        let gateway = Arc::new(MemoryGateway::new());
        let reconciler = reconciler(gateway.clone());

        let first = fetch("1000", vec![], vec![closed_deal("d1", "10", 1_700_000_000_000)]);
        reconciler.reconcile(1, &first).await.unwrap();

        let second = fetch(
            "1010",
            vec![],
            vec![closed_deal("d1", "10", 1_700_000_000_000), closed_deal("d2", "3", 1_700_000_200_000)],
        );
        let outcome = reconciler.reconcile(1, &second).await.unwrap();
        let ids: Vec<&str> = outcome.new_deals.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d2"]);
    }

    #[tokio::test]
    async fn test_positions_are_replaced_not_merged() {
        let gateway = Arc::new(MemoryGateway::new());
        let reconciler = reconciler(gateway.clone());

        let first = fetch("1000", vec![], vec![open_deal("p1"), open_deal("p2")]);
        reconciler.reconcile(1, &first).await.unwrap();
        assert_eq!(gateway.positions(1).await.unwrap().len(), 2);

        let second = fetch("1000", vec![], vec![open_deal("p3")]);
        reconciler.reconcile(1, &second).await.unwrap();
        let positions = gateway.positions(1).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].deal_id, "p3");

        let third = fetch("1000", vec![], vec![]);
        reconciler.reconcile(1, &third).await.unwrap();
        assert!(gateway.positions(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_and_unknown_deals_are_not_recorded() {
        let gateway = Arc::new(MemoryGateway::new());
        let reconciler = reconciler(gateway.clone());

        let input = fetch("1000", vec![], vec![open_deal("p1"), other_deal("x1", "pending")]);
        let outcome = reconciler.reconcile(1, &input).await.unwrap();

        assert!(outcome.new_deals.is_empty());
        assert_eq!(gateway.deal_count(1).await, 0);
        assert_eq!(outcome.positions.len(), 1);
    }

    #[tokio::test]
    async fn test_deal_recorded_once_it_closes() {
        let gateway = Arc::new(MemoryGateway::new());
        let reconciler = reconciler(gateway.clone());

        reconciler.reconcile(1, &fetch("1000", vec![], vec![open_deal("d1")])).await.unwrap();
        let outcome = reconciler
            .reconcile(1, &fetch("1005", vec![], vec![closed_deal("d1", "5", 1_700_000_000_000)]))
            .await
            .unwrap();

        assert_eq!(outcome.new_deals.len(), 1);
        assert!(outcome.positions.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_failure_aborts() {
        let gateway = Arc::new(FaultyGateway::new(MemoryGateway::new()));
        gateway.fail_snapshots(true);
        let reconciler = reconciler(gateway.clone());

        let input = fetch("1000", vec![order("o1", "pending", "1")], vec![closed_deal("d1", "1", 1)]);
        assert!(reconciler.reconcile(1, &input).await.is_err());
        assert_eq!(gateway.inner().deal_count(1).await, 0);
    }

    #[tokio::test]
    async fn test_failed_deal_insert_is_counted_and_batch_continues() {
        let gateway = Arc::new(FaultyGateway::new(MemoryGateway::new()));
        gateway.fail_deal("d2");
        let reconciler = reconciler(gateway.clone());

        let input = fetch(
            "1000",
            vec![],
            vec![
                closed_deal("d1", "1", 1_700_000_000_000),
                closed_deal("d2", "2", 1_700_000_000_000),
                closed_deal("d3", "3", 1_700_000_000_000),
            ],
        );
        let outcome = reconciler.reconcile(1, &input).await.unwrap();

        assert_eq!(outcome.deals_failed, 1);
        assert_eq!(outcome.new_deals.len(), 2);
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn test_snapshot_copies_state() {
        let gateway = Arc::new(MemoryGateway::new());
        let reconciler = reconciler(gateway.clone());

        let outcome = reconciler.reconcile(1, &fetch("1234.5", vec![], vec![])).await.unwrap();
        assert_eq!(outcome.snapshot.equity, "1234.5".parse::<Decimal>().unwrap());
        assert!(outcome.snapshot.id > 0);
        assert!(outcome.is_clean());
    }
}
