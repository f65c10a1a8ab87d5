//! The audit loop.

use std::io::Write;
use std::time::Duration;

use serde::Serialize;
use tasklane_consistency::metrics::MetricsSnapshot;
use tasklane_consistency::snapshot::{ConsistencySnapshot, SnapshotValidation};
use tasklane_consistency::{
    ConsistencyCheckResult, ConsistencyEngine, ConsistencyPolicy, OperationContext,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;

/// One audit iteration, printed as a JSON line.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    /// 1-based iteration number.
    pub iteration: u64,
    /// The full consistency check.
    pub check: ConsistencyCheckResult,
    /// Drift since the previous iteration's snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<SnapshotValidation>,
    /// Snapshot retained for the next iteration. When `drift` is present
    /// this is the snapshot the drift was computed from.
    pub snapshot: ConsistencySnapshot,
    /// Engine counters after this iteration.
    pub metrics: MetricsSnapshot,
}

/// Runs audits against one engine.
pub struct Auditor {
    engine: ConsistencyEngine,
    policy: ConsistencyPolicy,
    interval: Option<Duration>,
}

impl Auditor {
    /// Creates an auditor. `interval` of `None` audits once.
    #[must_use]
    pub fn new(
        engine: ConsistencyEngine,
        policy: ConsistencyPolicy,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            engine,
            policy,
            interval,
        }
    }

    /// Checks the database, then either advances the `previous` baseline
    /// or, on the first iteration, retains a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Domain` when the engine fails.
    pub async fn audit_once(
        &self,
        cx: &OperationContext,
        iteration: u64,
        previous: Option<Uuid>,
    ) -> Result<AuditReport, AppError> {
        let check = self
            .engine
            .perform_full_consistency_check(cx, &self.policy)
            .await?;
        let (drift, snapshot) = match previous {
            Some(baseline_id) => {
                let validation = self.engine.advance_snapshot(cx, baseline_id).await?;
                let snapshot = validation.current.clone();
                (Some(validation), snapshot)
            }
            None => (None, self.engine.create_consistency_snapshot(cx).await?),
        };

        if !check.is_consistent {
            warn!(
                iteration,
                violations = check.violations.len(),
                "database is inconsistent"
            );
        }
        Ok(AuditReport {
            iteration,
            check,
            drift,
            snapshot,
            metrics: self.engine.metrics(),
        })
    }

    /// Audits until the interval is unset or `cx` is cancelled, writing
    /// one JSON report per line to `out`. Returns the iterations run.
    ///
    /// # Errors
    ///
    /// Returns the first failed audit or write.
    pub async fn run<W: Write>(
        &self,
        cx: &OperationContext,
        out: &mut W,
    ) -> Result<u64, AppError> {
        let mut previous = None;
        let mut iteration = 0;
        loop {
            iteration += 1;
            let report = self.audit_once(cx, iteration, previous).await?;
            previous = Some(report.snapshot.snapshot_id);
            serde_json::to_writer(&mut *out, &report)?;
            writeln!(out)?;
            out.flush()?;
            info!(
                iteration,
                is_consistent = report.check.is_consistent,
                execution_time_ms = report.check.execution_time_ms,
                "audit complete"
            );

            let Some(interval) = self.interval else {
                break;
            };
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cx.cancelled() => {
                    info!(iteration, "auditor stopped");
                    break;
                }
            }
        }
        Ok(iteration)
    }
}
