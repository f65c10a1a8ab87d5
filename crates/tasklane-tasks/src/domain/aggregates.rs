//! Aggregate roots for the task context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasklane_core::aggregate::AggregateRoot;
use tasklane_core::error::DomainError;
use tasklane_core::event_log::StoredEvent;
use uuid::Uuid;

use super::commands::TaskStatus;
use super::events::TaskEventKind;

/// One entry of a task's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Position in the task stream.
    pub sequence_number: i64,
    /// The event type.
    pub event_type: String,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// A task rebuilt from its event stream.
///
/// Serializable so that it can be stored as a snapshot and resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTimeline {
    /// Aggregate identifier.
    pub id: Uuid,
    /// Current version (events applied).
    pub version: i64,
    /// Current title.
    pub title: String,
    /// Current status.
    pub status: TaskStatus,
    /// Current priority.
    pub priority: i32,
    /// Current project.
    pub project_id: Option<Uuid>,
    /// Every applied event, oldest first.
    pub history: Vec<TimelineEntry>,
}

impl TaskTimeline {
    /// Creates an empty timeline.
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            title: String::new(),
            status: TaskStatus::default(),
            priority: 0,
            project_id: None,
            history: Vec::new(),
        }
    }
}

impl AggregateRoot for TaskTimeline {
    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &StoredEvent) -> Result<(), DomainError> {
        let kind: TaskEventKind = serde_json::from_value(event.payload.clone()).map_err(|e| {
            DomainError::Infrastructure(format!("event deserialization failed: {e}"))
        })?;
        match kind {
            TaskEventKind::TaskCreated(created) => {
                self.title = created.title;
                self.status = created.status;
                self.priority = created.priority;
                self.project_id = created.project_id;
            }
            TaskEventKind::TaskUpdated(updated) => {
                if let Some(title) = updated.title {
                    self.title = title;
                }
                if let Some(status) = updated.status {
                    self.status = status;
                }
                if let Some(priority) = updated.priority {
                    self.priority = priority;
                }
            }
            TaskEventKind::TaskMoved(moved) => self.project_id = moved.to_project_id,
            other => {
                return Err(DomainError::Infrastructure(format!(
                    "unexpected event on task stream {}: {other:?}",
                    self.id
                )));
            }
        }
        self.version = event.sequence_number;
        self.history.push(TimelineEntry {
            sequence_number: event.sequence_number,
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domain::events::{ProjectDeleted, TaskCreated, TaskMoved, TaskUpdated};

    fn stored(task_id: Uuid, sequence_number: i64, event_type: &str, kind: &TaskEventKind) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            stream_id: task_id,
            event_type: event_type.to_owned(),
            payload: serde_json::to_value(kind).unwrap(),
            sequence_number,
            global_position: sequence_number,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            occurred_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_replay_folds_created_updated_and_moved() {
        // Arrange
        let task_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let events = vec![
            stored(
                task_id,
                1,
                "tasks.task_created",
                &TaskEventKind::TaskCreated(TaskCreated {
                    task_id,
                    project_id: None,
                    title: "Draft".into(),
                    status: TaskStatus::Todo,
                    priority: 1,
                }),
            ),
            stored(
                task_id,
                2,
                "tasks.task_updated",
                &TaskEventKind::TaskUpdated(TaskUpdated {
                    task_id,
                    title: None,
                    status: Some(TaskStatus::InProgress),
                    priority: Some(3),
                }),
            ),
            stored(
                task_id,
                3,
                "tasks.task_moved",
                &TaskEventKind::TaskMoved(TaskMoved {
                    task_id,
                    from_project_id: None,
                    to_project_id: Some(project_id),
                }),
            ),
        ];
        let mut timeline = TaskTimeline::new(task_id);

        // Act
        timeline.replay(&events).unwrap();

        // Assert
        assert_eq!(timeline.version(), 3);
        assert_eq!(timeline.title, "Draft");
        assert_eq!(timeline.status, TaskStatus::InProgress);
        assert_eq!(timeline.priority, 3);
        assert_eq!(timeline.project_id, Some(project_id));
        assert_eq!(timeline.history.len(), 3);
    }

    #[test]
    fn test_foreign_event_on_task_stream_fails() {
        let task_id = Uuid::new_v4();
        let event = stored(
            task_id,
            1,
            "tasks.project_deleted",
            &TaskEventKind::ProjectDeleted(ProjectDeleted {
                project_id: Uuid::new_v4(),
            }),
        );

        let result = TaskTimeline::new(task_id).apply(&event);

        assert!(matches!(result, Err(DomainError::Infrastructure(_))));
    }

    #[test]
    fn test_undecodable_payload_fails() {
        let task_id = Uuid::new_v4();
        let mut event = stored(
            task_id,
            1,
            "tasks.task_moved",
            &TaskEventKind::TaskMoved(TaskMoved {
                task_id,
                from_project_id: None,
                to_project_id: None,
            }),
        );
        event.payload = serde_json::json!({ "Unknown": {} });

        let result = TaskTimeline::new(task_id).apply(&event);

        match result {
            Err(DomainError::Infrastructure(message)) => {
                assert!(message.contains("deserialization"));
            }
            other => panic!("expected Infrastructure, got {other:?}"),
        }
    }
}
