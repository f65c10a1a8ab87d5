//! Per-engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters owned by one engine instance.
#[derive(Debug, Default)]
pub struct ConsistencyMetrics {
    retries: AtomicU64,
    conflicts: AtomicU64,
    violations_found: AtomicU64,
    auto_fixes_applied: AtomicU64,
    auto_fixes_failed: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
}

/// Point-in-time copy of [`ConsistencyMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Attempts that were retried.
    pub retries: u64,
    /// Retries caused by version conflicts.
    pub conflicts: u64,
    /// Violations reported by checks and audits.
    pub violations_found: u64,
    /// Violations repaired.
    pub auto_fixes_applied: u64,
    /// Repairs that failed.
    pub auto_fixes_failed: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions rolled back.
    pub transactions_rolled_back: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl ConsistencyMetrics {
    /// Records a retry; `conflict` marks it as caused by a version race.
    pub fn record_retry(&self, conflict: bool) {
        bump(&self.retries, 1);
        if conflict {
            bump(&self.conflicts, 1);
        }
    }

    /// Records violations found.
    pub fn record_violations(&self, count: usize) {
        bump(&self.violations_found, count as u64);
    }

    /// Records the result of an auto-fix pass.
    pub fn record_fixes(&self, applied: usize, failed: usize) {
        bump(&self.auto_fixes_applied, applied as u64);
        bump(&self.auto_fixes_failed, failed as u64);
    }

    /// Records a commit.
    pub fn record_commit(&self) {
        bump(&self.transactions_committed, 1);
    }

    /// Records a rollback.
    pub fn record_rollback(&self) {
        bump(&self.transactions_rolled_back, 1);
    }

    /// Reads all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            retries: read(&self.retries),
            conflicts: read(&self.conflicts),
            violations_found: read(&self.violations_found),
            auto_fixes_applied: read(&self.auto_fixes_applied),
            auto_fixes_failed: read(&self.auto_fixes_failed),
            transactions_committed: read(&self.transactions_committed),
            transactions_rolled_back: read(&self.transactions_rolled_back),
        }
    }
}
