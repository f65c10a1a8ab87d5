//! Commands for the task context.

use std::fmt;

use serde::{Deserialize, Serialize};
use tasklane_core::command::{Command, CommandKind, CommandMetadata};
use tasklane_core::error::DomainError;
use tasklane_core::version::VersionToken;
use uuid::Uuid;

use crate::schema::MAX_PRIORITY;

/// Workflow state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started.
    #[default]
    Todo,
    /// Being worked on.
    InProgress,
    /// Finished.
    Done,
}

impl TaskStatus {
    /// Every status, in workflow order.
    pub const ALL: [Self; 3] = [Self::Todo, Self::InProgress, Self::Done];

    /// Stored form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command to create a workspace.
#[derive(Debug, Clone)]
pub struct CreateWorkspace {
    /// Command metadata.
    pub metadata: CommandMetadata,
    /// The new workspace identifier.
    pub workspace_id: Uuid,
    /// Display name.
    pub name: String,
}

/// Command to create a project inside a workspace.
#[derive(Debug, Clone)]
pub struct CreateProject {
    /// Command metadata.
    pub metadata: CommandMetadata,
    /// The new project identifier.
    pub project_id: Uuid,
    /// The owning workspace.
    pub workspace_id: Uuid,
    /// Display name.
    pub name: String,
}

/// Command to delete a project that no task references.
#[derive(Debug, Clone)]
pub struct DeleteProject {
    /// Command metadata.
    pub metadata: CommandMetadata,
    /// The project to delete.
    pub project_id: Uuid,
    /// Version the caller last read.
    pub expected_version: VersionToken,
}

/// Command to create a task, optionally filed under a project.
#[derive(Debug, Clone)]
pub struct CreateTask {
    /// Command metadata.
    pub metadata: CommandMetadata,
    /// The new task identifier.
    pub task_id: Uuid,
    /// The project to file under.
    pub project_id: Option<Uuid>,
    /// Task title.
    pub title: String,
    /// Priority from 0 to 4.
    pub priority: i32,
}

/// Command to change a task's title, status or priority.
#[derive(Debug, Clone)]
pub struct UpdateTask {
    /// Command metadata.
    pub metadata: CommandMetadata,
    /// The task to change.
    pub task_id: Uuid,
    /// Version the caller last read.
    pub expected_version: VersionToken,
    /// New title.
    pub title: Option<String>,
    /// New status.
    pub status: Option<TaskStatus>,
    /// New priority.
    pub priority: Option<i32>,
}

/// Command to file a task under another project, or unfile it.
#[derive(Debug, Clone)]
pub struct MoveTask {
    /// Command metadata.
    pub metadata: CommandMetadata,
    /// The task to move.
    pub task_id: Uuid,
    /// Version the caller last read.
    pub expected_version: VersionToken,
    /// Destination project; `None` unfiles the task.
    pub project_id: Option<Uuid>,
}

/// Routing tag of [`TaskCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskCommandKind {
    /// [`CreateWorkspace`].
    CreateWorkspace,
    /// [`CreateProject`].
    CreateProject,
    /// [`DeleteProject`].
    DeleteProject,
    /// [`CreateTask`].
    CreateTask,
    /// [`UpdateTask`].
    UpdateTask,
    /// [`MoveTask`].
    MoveTask,
}

impl CommandKind for TaskCommandKind {
    fn name(self) -> &'static str {
        match self {
            Self::CreateWorkspace => "tasks.create_workspace",
            Self::CreateProject => "tasks.create_project",
            Self::DeleteProject => "tasks.delete_project",
            Self::CreateTask => "tasks.create_task",
            Self::UpdateTask => "tasks.update_task",
            Self::MoveTask => "tasks.move_task",
        }
    }
}

/// Every command of the task context.
#[derive(Debug, Clone)]
pub enum TaskCommand {
    /// Create a workspace.
    CreateWorkspace(CreateWorkspace),
    /// Create a project.
    CreateProject(CreateProject),
    /// Delete a project.
    DeleteProject(DeleteProject),
    /// Create a task.
    CreateTask(CreateTask),
    /// Change a task.
    UpdateTask(UpdateTask),
    /// Move a task between projects.
    MoveTask(MoveTask),
}

fn require_text(field: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_priority(priority: i32) -> Result<(), DomainError> {
    if !(0..=MAX_PRIORITY).contains(&priority) {
        return Err(DomainError::Validation(format!(
            "priority must be between 0 and {MAX_PRIORITY}, got {priority}"
        )));
    }
    Ok(())
}

impl Command for TaskCommand {
    type Kind = TaskCommandKind;

    fn kind(&self) -> TaskCommandKind {
        match self {
            Self::CreateWorkspace(_) => TaskCommandKind::CreateWorkspace,
            Self::CreateProject(_) => TaskCommandKind::CreateProject,
            Self::DeleteProject(_) => TaskCommandKind::DeleteProject,
            Self::CreateTask(_) => TaskCommandKind::CreateTask,
            Self::UpdateTask(_) => TaskCommandKind::UpdateTask,
            Self::MoveTask(_) => TaskCommandKind::MoveTask,
        }
    }

    fn metadata(&self) -> &CommandMetadata {
        match self {
            Self::CreateWorkspace(c) => &c.metadata,
            Self::CreateProject(c) => &c.metadata,
            Self::DeleteProject(c) => &c.metadata,
            Self::CreateTask(c) => &c.metadata,
            Self::UpdateTask(c) => &c.metadata,
            Self::MoveTask(c) => &c.metadata,
        }
    }

    fn validate(&self) -> Result<(), DomainError> {
        match self {
            Self::CreateWorkspace(c) => require_text("workspace name", &c.name),
            Self::CreateProject(c) => require_text("project name", &c.name),
            Self::CreateTask(c) => {
                require_text("task title", &c.title)?;
                require_priority(c.priority)
            }
            Self::UpdateTask(c) => {
                if c.title.is_none() && c.status.is_none() && c.priority.is_none() {
                    return Err(DomainError::Validation(
                        "update must change at least one field".into(),
                    ));
                }
                if let Some(title) = &c.title {
                    require_text("task title", title)?;
                }
                c.priority.map_or(Ok(()), require_priority)
            }
            Self::DeleteProject(_) | Self::MoveTask(_) => Ok(()),
        }
    }
}
