// Metrics collection for the synchronization engine

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by every polling worker
#[derive(Debug)]
pub struct SyncMetrics {
    // Cycle outcomes
    pub cycles_completed: AtomicCounter,
    pub cycles_failed: AtomicCounter,
    pub cycles_skipped: AtomicCounter,

    // Reconciliation
    pub deals_ingested: AtomicCounter,
    pub orders_failed: AtomicCounter,
    pub deals_failed: AtomicCounter,

    // Fan-out
    pub broadcasts_delivered: AtomicCounter,

    // Workers
    pub workers_running: AtomicGauge,
    pub workers_suspended: AtomicGauge,
    pub started_at: Instant,
}

/// Point-in-time copy of [`SyncMetrics`], suitable for logging
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
    pub deals_ingested: u64,
    pub orders_failed: u64,
    pub deals_failed: u64,
    pub broadcasts_delivered: u64,
    pub workers_running: u64,
    pub workers_suspended: u64,
    pub uptime_secs: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            cycles_completed: AtomicCounter::new(),
            cycles_failed: AtomicCounter::new(),
            cycles_skipped: AtomicCounter::new(),
            deals_ingested: AtomicCounter::new(),
            orders_failed: AtomicCounter::new(),
            deals_failed: AtomicCounter::new(),
            broadcasts_delivered: AtomicCounter::new(),
            workers_running: AtomicGauge::new(),
            workers_suspended: AtomicGauge::new(),
            started_at: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_completed: self.cycles_completed.get(),
            cycles_failed: self.cycles_failed.get(),
            cycles_skipped: self.cycles_skipped.get(),
            deals_ingested: self.deals_ingested.get(),
            orders_failed: self.orders_failed.get(),
            deals_failed: self.deals_failed.get(),
            broadcasts_delivered: self.broadcasts_delivered.get(),
            workers_running: self.workers_running.get(),
            workers_suspended: self.workers_suspended.get(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Percentage of attempted cycles that failed (0-100)
    pub fn failure_rate(&self) -> u64 {
        let failed = self.cycles_failed.get();
        let attempted = self.cycles_completed.get() + failed;
        if attempted > 0 {
            (failed * 100) / attempted
        } else {
            0
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe atomic counter
#[derive(Debug)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe atomic gauge
#[derive(Debug)]
pub struct AtomicGauge {
    value: AtomicU64,
}

impl AtomicGauge {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }
}

impl Default for AtomicGauge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_operations() {
        let counter = AtomicCounter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_gauge_never_underflows() {
        let gauge = AtomicGauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);

        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_failure_rate() {
        let metrics = SyncMetrics::new();
        assert_eq!(metrics.failure_rate(), 0);

        metrics.cycles_completed.add(3);
        metrics.cycles_failed.inc();
        assert_eq!(metrics.failure_rate(), 25);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles_completed, 3);
        assert_eq!(snapshot.cycles_failed, 1);
    }
}
