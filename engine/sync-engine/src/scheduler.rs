//! Polling scheduler: one worker task per active account
//!
//! Each worker ticks on a fixed interval and runs its account's cycle inline,
//! so a slow cycle delays the next tick instead of overlapping with it; ticks
//! missed in the meantime are dropped. Workers are independent: a failure in
//! one account never stops another.
//!
//! Every cycle of an account, whether run by its worker, by a replacement
//! worker or by [`SyncScheduler::sync_now`], shares one [`CycleGuard`]; worker
//! start, stop and replacement for one account are serialized.

use crate::broadcast::BroadcastHub;
use crate::config::SyncConfig;
use crate::cycle::{CycleDeps, CycleGuard, CycleReport, SyncCycle};
use crate::error::{bounded, Result, SyncError};
use crate::gateway::PersistenceGateway;
use crate::metrics::SyncMetrics;
use crate::model::{Account, AccountId};
use crate::notify::DealNotifier;
use broker_client::{BrokerConnector, BrokerErrorKind};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Lifecycle of an account's worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    /// Stopped after the broker rejected the account's credentials
    Suspended { reason: String },
    Stopped,
}

struct WorkerState {
    status: RwLock<WorkerStatus>,
    metrics: Arc<SyncMetrics>,
}

impl WorkerState {
    fn new(metrics: Arc<SyncMetrics>) -> Self {
        metrics.workers_running.inc();
        Self { status: RwLock::new(WorkerStatus::Running), metrics }
    }

    fn get(&self) -> WorkerStatus {
        self.status.read().clone()
    }

    fn set(&self, next: WorkerStatus) {
        let mut status = self.status.write();
        match *status {
            WorkerStatus::Running => self.metrics.workers_running.dec(),
            WorkerStatus::Suspended { .. } => self.metrics.workers_suspended.dec(),
            WorkerStatus::Stopped => {}
        }
        match next {
            WorkerStatus::Running => self.metrics.workers_running.inc(),
            WorkerStatus::Suspended { .. } => self.metrics.workers_suspended.inc(),
            WorkerStatus::Stopped => {}
        }
        *status = next;
    }
}

struct Worker {
    cycle: SyncCycle,
    state: Arc<WorkerState>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Signal the task and wait for it; an in-flight cycle runs to completion
    async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(account_id = self.cycle.account_id(), "Worker task panicked: {}", e);
            }
        }
        if self.state.get() != WorkerStatus::Stopped {
            self.state.set(WorkerStatus::Stopped);
        }
    }
}

/// Owns the per-account polling workers
pub struct SyncScheduler {
    config: SyncConfig,
    gateway: Arc<dyn PersistenceGateway>,
    connector: Arc<dyn BrokerConnector>,
    hub: Arc<BroadcastHub>,
    metrics: Arc<SyncMetrics>,
    deps: Arc<CycleDeps>,
    workers: DashMap<AccountId, Arc<Worker>>,
    guards: DashMap<AccountId, CycleGuard>,
    lifecycle: DashMap<AccountId, Arc<AsyncMutex<()>>>,
}

impl SyncScheduler {
    pub fn new(
        config: SyncConfig,
        gateway: Arc<dyn PersistenceGateway>,
        connector: Arc<dyn BrokerConnector>,
        hub: Arc<BroadcastHub>,
        notifier: Option<Arc<dyn DealNotifier>>,
    ) -> Self {
        let metrics = Arc::new(SyncMetrics::new());
        let deps = Arc::new(CycleDeps::new(
            gateway.clone(),
            hub.clone(),
            notifier,
            metrics.clone(),
            config.io_timeout(),
        ));

        Self {
            config,
            gateway,
            connector,
            hub,
            metrics,
            deps,
            workers: DashMap::new(),
            guards: DashMap::new(),
            lifecycle: DashMap::new(),
        }
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        self.metrics.clone()
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    /// Start a worker for every active account; returns how many started
    pub async fn start(&self) -> Result<usize> {
        let accounts =
            bounded("active_accounts", self.config.io_timeout(), self.gateway.active_accounts())
                .await?;

        let mut started = 0;
        for account in accounts {
            let account_id = account.id;
            let lock = self.lifecycle_lock(account_id);
            let _lifecycle = lock.lock().await;
            if self.worker_status(account_id) == Some(WorkerStatus::Running) {
                continue;
            }
            match self.spawn_worker(account).await {
                Ok(()) => started += 1,
                Err(e) => {
                    tracing::warn!(account_id, "Not starting worker for account: {}", e);
                }
            }
        }

        tracing::info!(
            started,
            poll_interval_ms = self.config.poll_interval_ms,
            "Synchronization scheduler started"
        );
        Ok(started)
    }

    /// Start polling an account added or re-activated at runtime.
    ///
    /// A running worker is left untouched; a stopped or suspended one is
    /// replaced with a fresh client built from the stored credentials.
    pub async fn start_account(&self, account_id: AccountId) -> Result<()> {
        let lock = self.lifecycle_lock(account_id);
        let _lifecycle = lock.lock().await;

        if self.worker_status(account_id) == Some(WorkerStatus::Running) {
            tracing::debug!(account_id, "Worker already running");
            return Ok(());
        }

        let account =
            bounded("account", self.config.io_timeout(), self.gateway.account(account_id))
                .await?
                .ok_or(SyncError::AccountNotFound(account_id))?;
        if !account.is_active {
            return Err(SyncError::AccountInactive(account_id));
        }

        self.spawn_worker(account).await
    }

    /// Restart a worker suspended on rejected credentials.
    ///
    /// Returns `false` when the account's worker was not suspended.
    pub async fn resume_account(&self, account_id: AccountId) -> Result<bool> {
        match self.worker_status(account_id) {
            Some(WorkerStatus::Suspended { .. }) => {
                self.start_account(account_id).await?;
                tracing::info!(account_id, "Resumed suspended worker");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Stop polling an account; other accounts are unaffected
    pub async fn stop_account(&self, account_id: AccountId) -> bool {
        let lock = self.lifecycle_lock(account_id);
        let _lifecycle = lock.lock().await;

        let worker = self.workers.get(&account_id).map(|w| w.value().clone());
        match worker {
            Some(worker) => {
                worker.stop().await;
                tracing::info!(account_id, "Stopped worker");
                true
            }
            None => false,
        }
    }

    /// Run one cycle right away, sharing the worker's in-flight guard
    pub async fn sync_now(&self, account_id: AccountId) -> Result<CycleReport> {
        let cycle = self.workers.get(&account_id).map(|w| w.cycle.clone());
        let cycle = match cycle {
            Some(cycle) => cycle,
            None => {
                let account =
                    bounded("account", self.config.io_timeout(), self.gateway.account(account_id))
                        .await?
                        .ok_or(SyncError::AccountNotFound(account_id))?;
                let client = self.connector.connect(&account.credentials())?;
                SyncCycle::new(account_id, client, self.deps.clone(), self.guard_for(account_id))
            }
        };
        cycle.run().await
    }

    pub fn worker_status(&self, account_id: AccountId) -> Option<WorkerStatus> {
        self.workers.get(&account_id).map(|w| w.state.get())
    }

    /// Accounts with a running worker, in ascending order
    pub fn active_accounts(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self
            .workers
            .iter()
            .filter(|entry| entry.value().state.get() == WorkerStatus::Running)
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every worker and wait for in-flight cycles to finish
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<Worker>> = self.workers.iter().map(|e| e.value().clone()).collect();
        tracing::info!(workers = workers.len(), "Shutting down synchronization scheduler");

        futures::future::join_all(workers.iter().map(|w| w.stop())).await;

        tracing::info!("Synchronization scheduler stopped");
    }

    /// The guard shared by every cycle of `account_id`
    fn guard_for(&self, account_id: AccountId) -> CycleGuard {
        self.guards.entry(account_id).or_default().clone()
    }

    fn lifecycle_lock(&self, account_id: AccountId) -> Arc<AsyncMutex<()>> {
        self.lifecycle.entry(account_id).or_default().clone()
    }

    /// Caller holds the account's lifecycle lock
    async fn spawn_worker(&self, account: Account) -> Result<()> {
        let account_id = account.id;
        let client = self.connector.connect(&account.credentials())?;

        // Replace whatever stopped or suspended worker is registered
        let previous = self.workers.remove(&account_id).map(|(_, w)| w);
        if let Some(previous) = previous {
            previous.stop().await;
        }

        let cycle = SyncCycle::new(account_id, client, self.deps.clone(), self.guard_for(account_id));
        let state = Arc::new(WorkerState::new(self.metrics.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_worker(
            cycle.clone(),
            self.config.poll_interval(),
            stop_rx,
            state.clone(),
        ));

        let worker = Worker { cycle, state, stop_tx, handle: Mutex::new(Some(handle)) };
        if let Some(displaced) = self.workers.insert(account_id, Arc::new(worker)) {
            tracing::warn!(account_id, "Displaced a worker registered concurrently");
            displaced.stop().await;
        }

        tracing::info!(account_id, external_account = %account.external_account_id, "Started worker");
        Ok(())
    }
}

async fn run_worker(
    cycle: SyncCycle,
    poll_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
    state: Arc<WorkerState>,
) {
    let account_id = cycle.account_id();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        if *stop_rx.borrow() {
            break;
        }

        match cycle.run().await {
            Ok(CycleReport::Completed(summary)) => {
                tracing::debug!(
                    account_id,
                    new_deals = summary.new_deals,
                    deliveries = summary.deliveries,
                    "Cycle completed"
                );
            }
            Ok(CycleReport::Skipped) => {}
            Err(e) => match e.broker_kind() {
                Some(BrokerErrorKind::Authorization) => {
                    tracing::error!(account_id, "Broker rejected credentials, suspending account: {}", e);
                    state.set(WorkerStatus::Suspended { reason: e.to_string() });
                    return;
                }
                Some(BrokerErrorKind::Transient) => {
                    tracing::warn!(account_id, "Transient broker failure, retrying next tick: {}", e);
                }
                Some(BrokerErrorKind::BadRequest) | Some(BrokerErrorKind::Malformed) => {
                    tracing::warn!(account_id, "Broker call rejected or unreadable: {}", e);
                }
                None => {
                    tracing::warn!(account_id, "Sync cycle failed: {}", e);
                }
            },
        }
    }

    state.set(WorkerStatus::Stopped);
    tracing::debug!(account_id, "Worker exited");
}
