//! Per-account fan-out of synchronization results to live listeners
//!
//! Listeners are addressed by (account id, [`MessageKind`]). Delivery is
//! non-blocking: a listener whose buffer is full misses that message, and a
//! listener whose receiving side has gone away is pruned on the next publish.

use crate::config::SyncConfig;
use crate::error::{bounded, Result};
use crate::gateway::PersistenceGateway;
use crate::model::{AccountId, Deal, Order, Position, Snapshot};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Category of a stream message, used for listener filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Snapshot,
    Market,
    DealClosed,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] =
        [MessageKind::Snapshot, MessageKind::Market, MessageKind::DealClosed];
}

/// Latest snapshot and open positions, sent once to each new listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchUpUpdate {
    pub snapshot: Option<Snapshot>,
    pub positions: Vec<Position>,
}

/// Summary published after every successful cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub equity: Decimal,
    pub balance: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub open_orders: Vec<Order>,
    pub positions: Vec<Position>,
    pub timestamp: DateTime<Utc>,
}

/// Stream message payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    Snapshot(CatchUpUpdate),
    Market(MarketUpdate),
    DealClosed(Deal),
}

impl StreamMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            StreamMessage::Snapshot(_) => MessageKind::Snapshot,
            StreamMessage::Market(_) => MessageKind::Market,
            StreamMessage::DealClosed(_) => MessageKind::DealClosed,
        }
    }
}

/// Message as handed to a listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub account_id: AccountId,
    #[serde(flatten)]
    pub message: StreamMessage,
    pub sent_at: DateTime<Utc>,
}

impl StreamEnvelope {
    pub fn new(account_id: AccountId, message: StreamMessage) -> Self {
        Self { account_id, message, sent_at: Utc::now() }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("listener buffer is full")]
    Full,

    #[error("listener is closed")]
    Closed,
}

/// Destination of stream messages; `deliver` must not block
pub trait UpdateSink: Send + Sync {
    fn deliver(&self, envelope: &StreamEnvelope) -> std::result::Result<(), DeliveryError>;
}

impl UpdateSink for mpsc::Sender<StreamEnvelope> {
    fn deliver(&self, envelope: &StreamEnvelope) -> std::result::Result<(), DeliveryError> {
        self.try_send(envelope.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl UpdateSink for mpsc::UnboundedSender<StreamEnvelope> {
    fn deliver(&self, envelope: &StreamEnvelope) -> std::result::Result<(), DeliveryError> {
        self.send(envelope.clone()).map_err(|_| DeliveryError::Closed)
    }
}

/// Handle identifying a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Listener {
    id: ListenerId,
    kinds: HashSet<MessageKind>,
    sink: Box<dyn UpdateSink>,
}

/// Registry of listeners per account
pub struct BroadcastHub {
    gateway: Arc<dyn PersistenceGateway>,
    listeners: Arc<RwLock<HashMap<AccountId, Vec<Listener>>>>,
    listener_buffer: usize,
    io_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: &SyncConfig) -> Self {
        Self {
            gateway,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            listener_buffer: config.listener_buffer,
            io_timeout: config.io_timeout(),
        }
    }

    /// Register `sink` for the given kinds of `account_id` messages.
    ///
    /// The latest snapshot and current positions are delivered to the sink
    /// first, whatever its filter. An empty `kinds` slice subscribes to
    /// every kind. The subscription map stays locked from the catch-up load
    /// until registration, so no publish can fall between the two.
    pub async fn subscribe<S>(
        &self,
        account_id: AccountId,
        kinds: &[MessageKind],
        sink: S,
    ) -> Result<ListenerId>
    where
        S: UpdateSink + 'static,
    {
        let mut listeners = self.listeners.write().await;

        let snapshot =
            bounded("latest_snapshot", self.io_timeout, self.gateway.latest_snapshot(account_id))
                .await?;
        let positions =
            bounded("positions", self.io_timeout, self.gateway.positions(account_id)).await?;

        let id = ListenerId::new();
        let catch_up = StreamEnvelope::new(
            account_id,
            StreamMessage::Snapshot(CatchUpUpdate { snapshot, positions }),
        );
        if let Err(DeliveryError::Closed) = sink.deliver(&catch_up) {
            tracing::debug!(account_id, listener = %id, "Listener closed before registration");
            return Ok(id);
        }

        let kinds: HashSet<MessageKind> = if kinds.is_empty() {
            MessageKind::ALL.into_iter().collect()
        } else {
            kinds.iter().copied().collect()
        };

        listeners.entry(account_id).or_default().push(Listener { id, kinds, sink: Box::new(sink) });

        tracing::debug!(account_id, listener = %id, "Listener subscribed");
        Ok(id)
    }

    /// Subscribe with a bounded channel sized from configuration
    pub async fn subscribe_channel(
        &self,
        account_id: AccountId,
        kinds: &[MessageKind],
    ) -> Result<(ListenerId, mpsc::Receiver<StreamEnvelope>)> {
        let (tx, rx) = mpsc::channel(self.listener_buffer);
        let id = self.subscribe(account_id, kinds, tx).await?;
        Ok((id, rx))
    }

    /// Remove a listener; `false` when it was not registered
    pub async fn unsubscribe(&self, account_id: AccountId, listener_id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let Some(account_listeners) = listeners.get_mut(&account_id) else {
            return false;
        };

        let before = account_listeners.len();
        account_listeners.retain(|l| l.id != listener_id);
        let removed = account_listeners.len() < before;
        if account_listeners.is_empty() {
            listeners.remove(&account_id);
        }
        removed
    }

    /// Deliver `message` to every matching listener of `account_id`.
    ///
    /// Returns the number of listeners that accepted it.
    pub async fn publish(&self, account_id: AccountId, message: StreamMessage) -> usize {
        let envelope = StreamEnvelope::new(account_id, message);
        let kind = envelope.kind();

        let mut listeners = self.listeners.write().await;
        let Some(account_listeners) = listeners.get_mut(&account_id) else {
            return 0;
        };

        let mut delivered = 0;
        account_listeners.retain(|listener| {
            if !listener.kinds.contains(&kind) {
                return true;
            }
            match listener.sink.deliver(&envelope) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(DeliveryError::Full) => {
                    tracing::warn!(account_id, listener = %listener.id, ?kind, "Listener buffer full, message dropped");
                    true
                }
                Err(DeliveryError::Closed) => {
                    tracing::debug!(account_id, listener = %listener.id, "Pruning closed listener");
                    false
                }
            }
        });

        if account_listeners.is_empty() {
            listeners.remove(&account_id);
        }
        delivered
    }

    pub async fn listener_count(&self, account_id: AccountId) -> usize {
        let listeners = self.listeners.read().await;
        listeners.get(&account_id).map_or(0, |v| v.len())
    }

    pub async fn total_listeners(&self) -> usize {
        let listeners = self.listeners.read().await;
        listeners.values().map(|v| v.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_gateway::MemoryGateway;
    use crate::testing::{closed_deal, snapshot_at, FaultyGateway};

    fn hub_with(gateway: Arc<MemoryGateway>, listener_buffer: usize) -> BroadcastHub {
        let config = SyncConfig { listener_buffer, ..Default::default() };
        BroadcastHub::new(gateway, &config)
    }

    fn market(equity: i64) -> StreamMessage {
        StreamMessage::Market(MarketUpdate {
            equity: Decimal::from(equity),
            balance: Decimal::from(equity),
            margin: Decimal::ZERO,
            free_margin: Decimal::from(equity),
            open_orders: Vec::new(),
            positions: Vec::new(),
            timestamp: Utc::now(),
        })
    }

    fn deal_closed(id: &str) -> StreamMessage {
        StreamMessage::DealClosed(Deal::from_broker(1, &closed_deal(id, "5", 1_700_000_000_000)))
    }

    #[tokio::test]
    async fn test_catch_up_delivered_on_subscribe() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.insert_snapshot(&snapshot_at(1, "1000", Utc::now())).await.unwrap();
        let hub = hub_with(gateway, 8);

        let (_id, mut rx) = hub.subscribe_channel(1, &[MessageKind::Market]).await.unwrap();

        let first = rx.try_recv().unwrap();
        match first.message {
            StreamMessage::Snapshot(catch_up) => {
                assert_eq!(catch_up.snapshot.unwrap().equity, Decimal::from(1000));
                assert!(catch_up.positions.is_empty());
            }
            other => panic!("expected catch-up, got {:?}", other),
        }
        assert_eq!(hub.listener_count(1).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_during_catch_up_load_is_not_lost() {
        let gateway = Arc::new(FaultyGateway::new(MemoryGateway::new()));
        gateway.set_read_delay(Duration::from_millis(100));
        let config = SyncConfig::default();
        let hub = Arc::new(BroadcastHub::new(gateway.clone(), &config));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.subscribe(1, &[], tx).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Lands while the catch-up is still loading
        assert_eq!(hub.publish(1, market(1000)).await, 1);
        subscriber.await.unwrap().unwrap();

        assert_eq!(rx.try_recv().unwrap().kind(), MessageKind::Snapshot);
        assert_eq!(rx.try_recv().unwrap().kind(), MessageKind::Market);
    }

    #[tokio::test]
    async fn test_publish_respects_kind_filter() {
        let hub = hub_with(Arc::new(MemoryGateway::new()), 8);
        let (_market_id, mut market_rx) =
            hub.subscribe_channel(1, &[MessageKind::Market]).await.unwrap();
        let (_deal_id, mut deal_rx) =
            hub.subscribe_channel(1, &[MessageKind::DealClosed]).await.unwrap();
        market_rx.try_recv().unwrap();
        deal_rx.try_recv().unwrap();

        assert_eq!(hub.publish(1, market(1000)).await, 1);
        assert_eq!(hub.publish(1, deal_closed("d1")).await, 1);

        assert_eq!(market_rx.try_recv().unwrap().kind(), MessageKind::Market);
        assert!(market_rx.try_recv().is_err());
        assert_eq!(deal_rx.try_recv().unwrap().kind(), MessageKind::DealClosed);
        assert!(deal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_is_scoped_to_account() {
        let hub = hub_with(Arc::new(MemoryGateway::new()), 8);
        let (_id, mut rx) = hub.subscribe_channel(2, &[]).await.unwrap();
        rx.try_recv().unwrap();

        assert_eq!(hub.publish(1, market(1000)).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_listener_is_pruned() {
        let hub = hub_with(Arc::new(MemoryGateway::new()), 8);
        let (_id, rx) = hub.subscribe_channel(1, &[]).await.unwrap();
        let (tx, mut live_rx) = mpsc::unbounded_channel();
        hub.subscribe(1, &[], tx).await.unwrap();
        live_rx.try_recv().unwrap();
        assert_eq!(hub.total_listeners().await, 2);

        drop(rx);
        assert_eq!(hub.publish(1, market(1000)).await, 1);
        assert_eq!(hub.listener_count(1).await, 1);
        assert!(live_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_listener_drops_message_but_stays() {
        let hub = hub_with(Arc::new(MemoryGateway::new()), 1);
        let (_id, mut rx) = hub.subscribe_channel(1, &[]).await.unwrap();

        // Buffer is occupied by the catch-up message
        assert_eq!(hub.publish(1, market(1000)).await, 0);
        assert_eq!(hub.listener_count(1).await, 1);

        rx.try_recv().unwrap();
        assert_eq!(hub.publish(1, market(1001)).await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = hub_with(Arc::new(MemoryGateway::new()), 8);
        let (id, _rx) = hub.subscribe_channel(1, &[]).await.unwrap();

        assert!(hub.unsubscribe(1, id).await);
        assert!(!hub.unsubscribe(1, id).await);
        assert_eq!(hub.total_listeners().await, 0);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = StreamEnvelope::new(4, deal_closed("d9"));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "deal_closed");
        assert_eq!(json["account_id"], 4);
        assert_eq!(json["data"]["id"], "d9");
    }
}
