//! Query handlers for the task context.
//!
//! A task's timeline is rebuilt from its event stream. When a snapshot
//! exists, replay starts from it and only later events are applied.

use serde::Serialize;
use tasklane_core::aggregate::AggregateRoot;
use tasklane_core::clock::Clock;
use tasklane_core::error::DomainError;
use tasklane_core::event_log::{EventLog, EventSnapshot};
use tracing::debug;
use uuid::Uuid;

use crate::domain::aggregates::TaskTimeline;

/// Read-only view of a task timeline.
#[derive(Debug, Serialize)]
pub struct TaskTimelineView {
    /// The rebuilt timeline.
    pub timeline: TaskTimeline,
    /// Version of the snapshot replay started from, if any.
    pub resumed_from: Option<i64>,
    /// Events applied on top of the snapshot.
    pub replayed_events: usize,
}

/// Rebuilds a task's timeline.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the task has neither events
/// nor a snapshot, or `DomainError::Infrastructure` if decoding fails.
pub async fn load_task_timeline(
    task_id: Uuid,
    log: &dyn EventLog,
) -> Result<TaskTimelineView, DomainError> {
    let snapshot = log.get_snapshot(task_id).await?;
    let (mut timeline, resumed_from) = match snapshot {
        Some(snapshot) => {
            let snapshot = snapshot.decode::<TaskTimeline>()?;
            (snapshot.state, Some(snapshot.version))
        }
        None => (TaskTimeline::new(task_id), None),
    };

    let events = log.get_events(task_id, resumed_from).await?;
    if events.is_empty() && resumed_from.is_none() {
        return Err(DomainError::AggregateNotFound(task_id));
    }
    timeline.replay(&events)?;
    debug!(%task_id, ?resumed_from, replayed = events.len(), "task timeline loaded");

    Ok(TaskTimelineView {
        timeline,
        resumed_from,
        replayed_events: events.len(),
    })
}

/// Stores a snapshot of a task's current timeline and returns its version.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for an unknown task, or the
/// event log's error.
pub async fn snapshot_task_timeline(
    task_id: Uuid,
    log: &dyn EventLog,
    clock: &dyn Clock,
) -> Result<i64, DomainError> {
    let view = load_task_timeline(task_id, log).await?;
    let version = view.timeline.version();
    let snapshot = EventSnapshot::encode(task_id, version, &view.timeline, clock.now())?;
    log.save_snapshot(snapshot).await?;
    debug!(%task_id, version, "task timeline snapshot saved");
    Ok(version)
}
