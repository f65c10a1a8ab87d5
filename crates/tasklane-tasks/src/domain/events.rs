//! Domain events for the task context.

use serde::{Deserialize, Serialize};
use tasklane_core::event::{DomainEvent, EventMetadata};
use uuid::Uuid;

use super::commands::TaskStatus;

/// Emitted when a workspace is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceCreated {
    /// The workspace identifier.
    pub workspace_id: Uuid,
    /// Display name.
    pub name: String,
}

/// Emitted when a project is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCreated {
    /// The project identifier.
    pub project_id: Uuid,
    /// The owning workspace.
    pub workspace_id: Uuid,
    /// Display name.
    pub name: String,
}

/// Emitted when a project is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDeleted {
    /// The project identifier.
    pub project_id: Uuid,
}

/// Emitted when a task is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreated {
    /// The task identifier.
    pub task_id: Uuid,
    /// The project it is filed under.
    pub project_id: Option<Uuid>,
    /// Task title.
    pub title: String,
    /// Initial status.
    pub status: TaskStatus,
    /// Priority from 0 to 4.
    pub priority: i32,
}

/// Emitted when a task's title, status or priority changes. Only changed
/// fields are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdated {
    /// The task identifier.
    pub task_id: Uuid,
    /// New title.
    pub title: Option<String>,
    /// New status.
    pub status: Option<TaskStatus>,
    /// New priority.
    pub priority: Option<i32>,
}

/// Emitted when a task is filed under another project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMoved {
    /// The task identifier.
    pub task_id: Uuid,
    /// Previous project.
    pub from_project_id: Option<Uuid>,
    /// New project.
    pub to_project_id: Option<Uuid>,
}

/// Event payload variants for the task context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskEventKind {
    /// A workspace was created.
    WorkspaceCreated(WorkspaceCreated),
    /// A project was created.
    ProjectCreated(ProjectCreated),
    /// A project was deleted.
    ProjectDeleted(ProjectDeleted),
    /// A task was created.
    TaskCreated(TaskCreated),
    /// A task changed.
    TaskUpdated(TaskUpdated),
    /// A task moved.
    TaskMoved(TaskMoved),
}

/// Domain event envelope for the task context.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: TaskEventKind,
}

impl DomainEvent for TaskEvent {
    fn event_type(&self) -> &'static str {
        match &self.kind {
            TaskEventKind::WorkspaceCreated(_) => "tasks.workspace_created",
            TaskEventKind::ProjectCreated(_) => "tasks.project_created",
            TaskEventKind::ProjectDeleted(_) => "tasks.project_deleted",
            TaskEventKind::TaskCreated(_) => "tasks.task_created",
            TaskEventKind::TaskUpdated(_) => "tasks.task_updated",
            TaskEventKind::TaskMoved(_) => "tasks.task_moved",
        }
    }

    fn to_payload(&self) -> serde_json::Value {
        // Serialization of derived Serialize types to Value is infallible.
        serde_json::to_value(&self.kind).expect("TaskEventKind serialization is infallible")
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}
