//! Metrics collection for monitoring the poll loop

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters since process start
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Pair ticks evaluated
    pub ticks: u64,
    /// Pair ticks skipped on a feed error
    pub ticks_skipped: u64,
    pub thresholds_released: u64,
    /// Order outcomes
    pub orders_submitted: u64,
    pub orders_filled: u64,
    pub orders_failed: u64,
    /// Orders found already placed during reconciliation
    pub orders_reconciled: u64,
    pub pairs_halted: u64,
}

/// Thread-safe metrics collector
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    ticks: AtomicU64,
    ticks_skipped: AtomicU64,
    thresholds_released: AtomicU64,
    orders_submitted: AtomicU64,
    orders_filled: AtomicU64,
    orders_failed: AtomicU64,
    orders_reconciled: AtomicU64,
    pairs_halted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ticks(&self) {
        self.inner.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ticks_skipped(&self) {
        self.inner.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_thresholds_released(&self, n: u64) {
        self.inner.thresholds_released.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_orders_submitted(&self) {
        self.inner.orders_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_filled(&self) {
        self.inner.orders_filled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_failed(&self) {
        self.inner.orders_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_reconciled(&self) {
        self.inner.orders_reconciled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pairs_halted(&self) {
        self.inner.pairs_halted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks: self.inner.ticks.load(Ordering::Relaxed),
            ticks_skipped: self.inner.ticks_skipped.load(Ordering::Relaxed),
            thresholds_released: self.inner.thresholds_released.load(Ordering::Relaxed),
            orders_submitted: self.inner.orders_submitted.load(Ordering::Relaxed),
            orders_filled: self.inner.orders_filled.load(Ordering::Relaxed),
            orders_failed: self.inner.orders_failed.load(Ordering::Relaxed),
            orders_reconciled: self.inner.orders_reconciled.load(Ordering::Relaxed),
            pairs_halted: self.inner.pairs_halted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.inc_ticks();
        clone.add_thresholds_released(2);
        metrics.inc_orders_filled();

        let snap = metrics.snapshot();
        assert_eq!(snap.ticks, 1);
        assert_eq!(snap.thresholds_released, 2);
        assert_eq!(snap.orders_filled, 1);
        assert_eq!(snap.pairs_halted, 0);
    }
}
