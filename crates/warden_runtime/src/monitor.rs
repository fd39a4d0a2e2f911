//! Lock metrics.
//!
//! Counters are updated by the coordinator and read as a snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time coordinator metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Successful acquisitions
    pub acquired: u64,
    /// Acquisitions that gave up at the timeout
    pub timed_out: u64,
    /// Total time spent waiting by successful acquisitions, in microseconds
    pub wait_micros: u64,
    /// Path entries currently in the lock table
    pub tracked_paths: usize,
    /// Tenant subtree entries currently in the lock table
    pub tracked_tenants: usize,
}

impl LockStats {
    /// Mean wait of successful acquisitions
    #[must_use]
    pub fn mean_wait(&self) -> Duration {
        if self.acquired == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.wait_micros / self.acquired)
    }

    /// Share of acquisitions that timed out (0.0 - 1.0)
    #[must_use]
    pub fn timeout_rate(&self) -> f64 {
        let total = self.acquired + self.timed_out;
        if total == 0 {
            return 0.0;
        }
        self.timed_out as f64 / total as f64
    }
}

/// Shared counters
#[derive(Debug, Default)]
pub(crate) struct LockMetrics {
    acquired: AtomicU64,
    timed_out: AtomicU64,
    wait_micros: AtomicU64,
}

impl LockMetrics {
    pub(crate) fn record_acquired(&self, waited: Duration) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        self.wait_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, tracked_paths: usize, tracked_tenants: usize) -> LockStats {
        LockStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            wait_micros: self.wait_micros.load(Ordering::Relaxed),
            tracked_paths,
            tracked_tenants,
        }
    }
}
