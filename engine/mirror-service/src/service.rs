//! Service state management and component initialization

use anyhow::{Context, Result};
use broker_client::{BrokerConnector, PassthroughDecryptor, StocksTraderConnector};
use std::sync::Arc;
use std::time::Duration;
use sync_engine::{
    BroadcastHub, DealNotifier, LoggingNotifier, MemoryGateway, PersistenceGateway, PgGateway,
    SyncScheduler,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ServiceConfig;
use crate::notifier::TelegramNotifier;

/// Service state containing all initialized components
pub struct ServiceState {
    /// Service configuration
    pub config: ServiceConfig,

    /// Store shared by every component
    pub gateway: Arc<dyn PersistenceGateway>,

    /// Fan-out of cycle results to live listeners
    pub hub: Arc<BroadcastHub>,

    /// Per-account polling workers
    pub scheduler: Arc<SyncScheduler>,

    stop_tx: watch::Sender<bool>,
}

impl ServiceState {
    /// Create a new service state with all components initialized
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        info!("Initializing service components...");

        let gateway: Arc<dyn PersistenceGateway> = if config.service.dry_run {
            info!("Dry-run mode: using in-memory store");
            Arc::new(MemoryGateway::new())
        } else {
            info!("Connecting to PostgreSQL...");
            let pg = PgGateway::connect(&config.database.url, config.database.max_connections)
                .await
                .context("Failed to initialize PostgreSQL gateway")?;
            Arc::new(pg)
        };

        let connector: Arc<dyn BrokerConnector> = Arc::new(StocksTraderConnector::new(
            config.broker.clone(),
            Arc::new(PassthroughDecryptor),
        ));

        let notifier: Arc<dyn DealNotifier> = match TelegramNotifier::from_config(&config.telegram)
            .context("Failed to create Telegram notifier")?
        {
            Some(telegram) => {
                info!("Telegram deal notifications enabled");
                Arc::new(telegram)
            }
            None => Arc::new(LoggingNotifier),
        };

        let hub = Arc::new(BroadcastHub::new(gateway.clone(), &config.sync));
        let scheduler = Arc::new(SyncScheduler::new(
            config.sync.clone(),
            gateway.clone(),
            connector,
            hub.clone(),
            Some(notifier),
        ));

        let (stop_tx, _) = watch::channel(false);
        Ok(Self { config, gateway, hub, scheduler, stop_tx })
    }

    /// Start one worker per active account
    pub async fn start(&self) -> Result<usize> {
        let started = self.scheduler.start().await.context("Failed to start scheduler")?;
        if started == 0 {
            tracing::warn!("No active accounts to synchronize");
        }
        Ok(started)
    }

    /// Periodically log scheduler metrics until shutdown
    pub fn spawn_metrics_reporter(&self) -> Option<JoinHandle<()>> {
        let interval_secs = self.config.service.metrics_log_interval_secs;
        if interval_secs == 0 {
            return None;
        }

        let metrics = self.scheduler.metrics();
        let hub = self.hub.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = metrics.snapshot();
                        let listeners = hub.total_listeners().await;
                        info!(
                            cycles_completed = snapshot.cycles_completed,
                            cycles_failed = snapshot.cycles_failed,
                            cycles_skipped = snapshot.cycles_skipped,
                            deals_ingested = snapshot.deals_ingested,
                            broadcasts = snapshot.broadcasts_delivered,
                            workers_running = snapshot.workers_running,
                            workers_suspended = snapshot.workers_suspended,
                            listeners,
                            "Sync metrics"
                        );
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        }))
    }

    /// Graceful shutdown of all components
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        let _ = self.stop_tx.send(true);
        self.scheduler.shutdown().await;
    }
}
