//! Command handlers for the task context.
//!
//! Every handler runs its mutation as one consistent unit of work: rows are
//! written through the transaction context (version-guarded, reference- and
//! rule-checked before commit) and the resulting events are appended in the
//! same transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tasklane_command_bus::{CommandBus, CommandHandler};
use tasklane_consistency::{ConsistencyEngine, ConsistencyPolicy, ConsistentResult, OperationContext};
use tasklane_core::command::{Command, CommandMetadata};
use tasklane_core::error::DomainError;
use tasklane_core::event::EventMetadata;
use tasklane_core::event_log::StoredEvent;
use tasklane_core::version::VersionToken;
use tasklane_core::violation::ConsistencyViolation;
use uuid::Uuid;

use crate::domain::commands::{TaskCommand, TaskCommandKind, TaskStatus};
use crate::domain::events::{
    ProjectCreated, ProjectDeleted, TaskCreated, TaskEvent, TaskEventKind, TaskMoved, TaskUpdated,
    WorkspaceCreated,
};
use crate::schema::{PROJECT, TASK, WORKSPACE};

/// What a handled command produced.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// The aggregate the command targeted.
    pub aggregate_id: Uuid,
    /// Version after the command; `None` once the row is deleted.
    pub version: Option<VersionToken>,
    /// Attempts the engine needed.
    pub attempts: u32,
    /// Events appended at commit.
    pub events: Vec<StoredEvent>,
    /// Non-fatal findings.
    pub warnings: Vec<ConsistencyViolation>,
}

impl CommandOutcome {
    fn from_result(aggregate_id: Uuid, result: ConsistentResult<Option<VersionToken>>) -> Self {
        Self {
            aggregate_id,
            version: result.value,
            attempts: result.attempts,
            events: result.events,
            warnings: result.warnings,
        }
    }
}

/// The bus type of the task context.
pub type TaskCommandBus = CommandBus<TaskCommand, CommandOutcome>;

/// Builds a bus with every task handler registered.
///
/// # Errors
///
/// Returns `DuplicateHandler` if registration collides.
pub fn task_command_bus(
    engine: Arc<ConsistencyEngine>,
    policy: ConsistencyPolicy,
) -> Result<TaskCommandBus, DomainError> {
    let mut bus = TaskCommandBus::new();
    bus.register(Arc::new(CreateWorkspaceHandler::new(
        Arc::clone(&engine),
        policy.clone(),
    )))?;
    bus.register(Arc::new(ProjectCommandHandler::new(
        Arc::clone(&engine),
        policy.clone(),
    )))?;
    bus.register(Arc::new(TaskCommandHandler::new(engine, policy)))?;
    Ok(bus)
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn reference(id: Option<Uuid>) -> Value {
    id.map_or(Value::Null, |id| Value::String(id.to_string()))
}

fn event(
    metadata: &CommandMetadata,
    stream_id: Uuid,
    occurred_at: DateTime<Utc>,
    kind: TaskEventKind,
) -> TaskEvent {
    TaskEvent {
        metadata: EventMetadata {
            event_id: Uuid::new_v4(),
            stream_id,
            correlation_id: Some(metadata.correlation_or_command_id()),
            causation_id: Some(metadata.command_id),
            user_id: metadata.user_id,
            occurred_at,
        },
        kind,
    }
}

/// Policy for commands that carry the caller's version token. A conflict
/// on that token repeats on every attempt, so the caller must refetch.
fn caller_token_policy(policy: &ConsistencyPolicy) -> ConsistencyPolicy {
    policy.clone().with_conflict_retries(false)
}

fn misrouted(handler: &str, command: &TaskCommand) -> DomainError {
    DomainError::Infrastructure(format!(
        "{handler} cannot handle {}",
        command.command_type()
    ))
}

/// Handles `CreateWorkspace`.
pub struct CreateWorkspaceHandler {
    engine: Arc<ConsistencyEngine>,
    policy: ConsistencyPolicy,
}

impl CreateWorkspaceHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(engine: Arc<ConsistencyEngine>, policy: ConsistencyPolicy) -> Self {
        Self { engine, policy }
    }
}

#[async_trait]
impl CommandHandler<TaskCommand, CommandOutcome> for CreateWorkspaceHandler {
    fn name(&self) -> &'static str {
        "create_workspace"
    }

    fn command_kind(&self) -> Option<TaskCommandKind> {
        Some(TaskCommandKind::CreateWorkspace)
    }

    async fn handle(
        &self,
        cx: &OperationContext,
        command: TaskCommand,
    ) -> Result<CommandOutcome, DomainError> {
        let command = match command {
            TaskCommand::CreateWorkspace(c) => c,
            other => return Err(misrouted(self.name(), &other)),
        };
        let workspace_id = command.workspace_id;
        let result = self
            .engine
            .execute_with_consistency(cx, &self.policy, move |tx| {
                let command = command.clone();
                Box::pin(async move {
                    let now = tx.now();
                    tx.create(
                        WORKSPACE,
                        command.workspace_id,
                        fields(json!({ "name": command.name, "created_at": now })),
                    )
                    .await?;
                    tx.raise(&event(
                        &command.metadata,
                        command.workspace_id,
                        now,
                        TaskEventKind::WorkspaceCreated(WorkspaceCreated {
                            workspace_id: command.workspace_id,
                            name: command.name.clone(),
                        }),
                    ));
                    Ok(Some(VersionToken::INITIAL))
                })
            })
            .await?;
        Ok(CommandOutcome::from_result(workspace_id, result))
    }
}

/// Handles `CreateProject` and `DeleteProject`.
pub struct ProjectCommandHandler {
    engine: Arc<ConsistencyEngine>,
    policy: ConsistencyPolicy,
}

impl ProjectCommandHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(engine: Arc<ConsistencyEngine>, policy: ConsistencyPolicy) -> Self {
        Self { engine, policy }
    }
}

#[async_trait]
impl CommandHandler<TaskCommand, CommandOutcome> for ProjectCommandHandler {
    fn name(&self) -> &'static str {
        "projects"
    }

    fn can_handle(&self, command: &TaskCommand) -> bool {
        matches!(
            command,
            TaskCommand::CreateProject(_) | TaskCommand::DeleteProject(_)
        )
    }

    async fn handle(
        &self,
        cx: &OperationContext,
        command: TaskCommand,
    ) -> Result<CommandOutcome, DomainError> {
        match command {
            TaskCommand::CreateProject(command) => {
                let project_id = command.project_id;
                let result = self
                    .engine
                    .execute_with_consistency(cx, &self.policy, move |tx| {
                        let command = command.clone();
                        Box::pin(async move {
                            let now = tx.now();
                            let row = json!({
                                "workspace_id": command.workspace_id.to_string(),
                                "name": command.name,
                                "created_at": now,
                            });
                            tx.create(PROJECT, command.project_id, fields(row)).await?;
                            tx.raise(&event(
                                &command.metadata,
                                command.project_id,
                                now,
                                TaskEventKind::ProjectCreated(ProjectCreated {
                                    project_id: command.project_id,
                                    workspace_id: command.workspace_id,
                                    name: command.name.clone(),
                                }),
                            ));
                            Ok(Some(VersionToken::INITIAL))
                        })
                    })
                    .await?;
                Ok(CommandOutcome::from_result(project_id, result))
            }
            TaskCommand::DeleteProject(command) => {
                let project_id = command.project_id;
                let policy = caller_token_policy(&self.policy);
                let result = self
                    .engine
                    .execute_with_consistency(cx, &policy, move |tx| {
                        let command = command.clone();
                        Box::pin(async move {
                            tx.delete(PROJECT, command.project_id, command.expected_version)
                                .await?;
                            let now = tx.now();
                            tx.raise(&event(
                                &command.metadata,
                                command.project_id,
                                now,
                                TaskEventKind::ProjectDeleted(ProjectDeleted {
                                    project_id: command.project_id,
                                }),
                            ));
                            Ok(None)
                        })
                    })
                    .await?;
                Ok(CommandOutcome::from_result(project_id, result))
            }
            other => Err(misrouted(self.name(), &other)),
        }
    }
}

/// Handles `CreateTask`, `UpdateTask` and `MoveTask`.
pub struct TaskCommandHandler {
    engine: Arc<ConsistencyEngine>,
    policy: ConsistencyPolicy,
}

impl TaskCommandHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(engine: Arc<ConsistencyEngine>, policy: ConsistencyPolicy) -> Self {
        Self { engine, policy }
    }
}

#[async_trait]
impl CommandHandler<TaskCommand, CommandOutcome> for TaskCommandHandler {
    fn name(&self) -> &'static str {
        "tasks"
    }

    fn can_handle(&self, command: &TaskCommand) -> bool {
        matches!(
            command,
            TaskCommand::CreateTask(_) | TaskCommand::UpdateTask(_) | TaskCommand::MoveTask(_)
        )
    }

    async fn handle(
        &self,
        cx: &OperationContext,
        command: TaskCommand,
    ) -> Result<CommandOutcome, DomainError> {
        match command {
            TaskCommand::CreateTask(command) => {
                let task_id = command.task_id;
                let result = self
                    .engine
                    .execute_with_consistency(cx, &self.policy, move |tx| {
                        let command = command.clone();
                        Box::pin(async move {
                            let now = tx.now();
                            let status = TaskStatus::Todo;
                            let row = json!({
                                "project_id": reference(command.project_id),
                                "title": command.title,
                                "status": status.as_str(),
                                "priority": command.priority,
                                "created_at": now,
                            });
                            tx.create(TASK, command.task_id, fields(row)).await?;
                            tx.raise(&event(
                                &command.metadata,
                                command.task_id,
                                now,
                                TaskEventKind::TaskCreated(TaskCreated {
                                    task_id: command.task_id,
                                    project_id: command.project_id,
                                    title: command.title.clone(),
                                    status,
                                    priority: command.priority,
                                }),
                            ));
                            Ok(Some(VersionToken::INITIAL))
                        })
                    })
                    .await?;
                Ok(CommandOutcome::from_result(task_id, result))
            }
            TaskCommand::UpdateTask(command) => {
                let task_id = command.task_id;
                let policy = caller_token_policy(&self.policy);
                let result = self
                    .engine
                    .execute_with_consistency(cx, &policy, move |tx| {
                        let command = command.clone();
                        Box::pin(async move {
                            let mut row = Map::new();
                            if let Some(title) = &command.title {
                                row.insert("title".into(), Value::from(title.as_str()));
                            }
                            if let Some(status) = command.status {
                                row.insert("status".into(), Value::from(status.as_str()));
                            }
                            if let Some(priority) = command.priority {
                                row.insert("priority".into(), Value::from(priority));
                            }
                            let version = tx
                                .update(TASK, command.task_id, command.expected_version, row)
                                .await?;
                            let now = tx.now();
                            tx.raise(&event(
                                &command.metadata,
                                command.task_id,
                                now,
                                TaskEventKind::TaskUpdated(TaskUpdated {
                                    task_id: command.task_id,
                                    title: command.title.clone(),
                                    status: command.status,
                                    priority: command.priority,
                                }),
                            ));
                            Ok(version)
                        })
                    })
                    .await?;
                Ok(CommandOutcome::from_result(task_id, result))
            }
            TaskCommand::MoveTask(command) => {
                let task_id = command.task_id;
                let policy = caller_token_policy(&self.policy);
                let result = self
                    .engine
                    .execute_with_consistency(cx, &policy, move |tx| {
                        let command = command.clone();
                        Box::pin(async move {
                            let current = tx.get(TASK, command.task_id).await?;
                            let from_project_id = current
                                .get("project_id")
                                .and_then(Value::as_str)
                                .and_then(|s| Uuid::parse_str(s).ok());
                            let row = fields(json!({ "project_id": reference(command.project_id) }));
                            let version = tx
                                .update(TASK, command.task_id, command.expected_version, row)
                                .await?;
                            let now = tx.now();
                            tx.raise(&event(
                                &command.metadata,
                                command.task_id,
                                now,
                                TaskEventKind::TaskMoved(TaskMoved {
                                    task_id: command.task_id,
                                    from_project_id,
                                    to_project_id: command.project_id,
                                }),
                            ));
                            Ok(version)
                        })
                    })
                    .await?;
                Ok(CommandOutcome::from_result(task_id, result))
            }
            other => Err(misrouted(self.name(), &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use tasklane_consistency::EntityRegistry;
    use tasklane_core::clock::Clock;
    use tasklane_core::event_log::EventLog;
    use tasklane_test_support::{FixedClock, InMemoryDatabase, NoJitter, RecordingSleeper};

    use super::*;
    use crate::domain::commands::{
        CreateProject, CreateTask, CreateWorkspace, DeleteProject, MoveTask, UpdateTask,
    };
    use crate::schema::task_registry;

    struct Harness {
        db: Arc<InMemoryDatabase>,
        bus: TaskCommandBus,
        clock: FixedClock,
        sleeper: Arc<RecordingSleeper>,
        cx: OperationContext,
    }

    fn harness() -> Harness {
        let db = Arc::new(InMemoryDatabase::new());
        let registry: Arc<EntityRegistry> = Arc::new(task_registry().unwrap());
        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let sleeper = Arc::new(RecordingSleeper::new());
        let engine = ConsistencyEngine::builder(db.clone(), registry)
            .clock(Arc::new(clock))
            .sleeper(sleeper.clone())
            .jitter(Arc::new(NoJitter))
            .build();
        let policy = ConsistencyPolicy::default().with_retry_delay(Duration::from_millis(1));
        let bus = task_command_bus(Arc::new(engine), policy).unwrap();
        Harness {
            db,
            bus,
            clock,
            sleeper,
            cx: OperationContext::background(),
        }
    }

    fn metadata(clock: &dyn Clock) -> CommandMetadata {
        CommandMetadata::new(clock).with_user(Uuid::from_u128(7))
    }

    async fn create_workspace(h: &Harness) -> Uuid {
        let workspace_id = Uuid::new_v4();
        h.bus
            .send(&h.cx, TaskCommand::CreateWorkspace(CreateWorkspace {
                metadata: metadata(&h.clock),
                workspace_id,
                name: "Operations".into(),
            }))
            .await
            .unwrap();
        workspace_id
    }

    async fn create_project(h: &Harness, workspace_id: Uuid) -> Uuid {
        let project_id = Uuid::new_v4();
        h.bus
            .send(&h.cx, TaskCommand::CreateProject(CreateProject {
                metadata: metadata(&h.clock),
                project_id,
                workspace_id,
                name: "Launch".into(),
            }))
            .await
            .unwrap();
        project_id
    }

    async fn create_task(h: &Harness, project_id: Option<Uuid>) -> Uuid {
        let task_id = Uuid::new_v4();
        h.bus
            .send(&h.cx, TaskCommand::CreateTask(CreateTask {
                metadata: metadata(&h.clock),
                task_id,
                project_id,
                title: "Write copy".into(),
                priority: 2,
            }))
            .await
            .unwrap();
        task_id
    }

    #[test]
    fn test_bus_registers_every_handler() {
        let h = harness();

        assert_eq!(h.bus.len(), 3);
    }

    #[tokio::test]
    async fn test_create_workspace_writes_row_and_event() {
        // Arrange
        let h = harness();
        let workspace_id = Uuid::new_v4();

        // Act
        let outcome = h
            .bus
            .send(&h.cx, TaskCommand::CreateWorkspace(CreateWorkspace {
                metadata: metadata(&h.clock),
                workspace_id,
                name: "Operations".into(),
            }))
            .await
            .unwrap();

        // Assert
        assert_eq!(outcome.aggregate_id, workspace_id);
        assert_eq!(outcome.version, Some(VersionToken::INITIAL));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].event_type, "tasks.workspace_created");
        assert_eq!(outcome.events[0].user_id, Some(Uuid::from_u128(7)));
        let row = h.db.record("workspaces", workspace_id).unwrap();
        assert_eq!(row.get("name"), Some(&json!("Operations")));
        assert_eq!(row.get_i64("version"), Some(1));
    }

    #[tokio::test]
    async fn test_project_in_missing_workspace_is_rejected() {
        let h = harness();

        let result = h
            .bus
            .send(&h.cx, TaskCommand::CreateProject(CreateProject {
                metadata: metadata(&h.clock),
                project_id: Uuid::new_v4(),
                workspace_id: Uuid::new_v4(),
                name: "Launch".into(),
            }))
            .await;

        match result {
            Err(DomainError::ReferentialIntegrity(violations)) => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].entity_type, "projects");
            }
            other => panic!("expected ReferentialIntegrity, got {other:?}"),
        }
        assert_eq!(h.db.count("projects"), 0);
        assert!(h.db.event_log().is_empty());
    }

    #[tokio::test]
    async fn test_update_task_bumps_version_and_raises_event() {
        // Arrange
        let h = harness();
        let task_id = create_task(&h, None).await;

        // Act
        let outcome = h
            .bus
            .send(&h.cx, TaskCommand::UpdateTask(UpdateTask {
                metadata: metadata(&h.clock),
                task_id,
                expected_version: VersionToken::INITIAL,
                title: None,
                status: Some(TaskStatus::Done),
                priority: None,
            }))
            .await
            .unwrap();

        // Assert
        assert_eq!(outcome.version.map(VersionToken::get), Some(2));
        assert_eq!(outcome.events[0].sequence_number, 2);
        let row = h.db.record("tasks", task_id).unwrap();
        assert_eq!(row.get("status"), Some(&json!("done")));
        assert_eq!(row.get("title"), Some(&json!("Write copy")));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts_without_retrying() {
        let h = harness();
        let task_id = create_task(&h, None).await;
        h.db.set_field("tasks", task_id, "version", json!(3));

        let result = h
            .bus
            .send(&h.cx, TaskCommand::UpdateTask(UpdateTask {
                metadata: metadata(&h.clock),
                task_id,
                expected_version: VersionToken::INITIAL,
                title: Some("Rewrite".into()),
                status: None,
                priority: None,
            }))
            .await;

        match result {
            Err(DomainError::ConcurrencyConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 3);
            }
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }
        assert!(h.sleeper.delays().is_empty());
        assert_eq!(h.db.event_log().stream_version(task_id), 1);
    }

    #[tokio::test]
    async fn test_stale_delete_conflicts_without_retrying() {
        let h = harness();
        let workspace_id = create_workspace(&h).await;
        let project_id = create_project(&h, workspace_id).await;
        h.db.set_field("projects", project_id, "version", json!(2));

        let result = h
            .bus
            .send(&h.cx, TaskCommand::DeleteProject(DeleteProject {
                metadata: metadata(&h.clock),
                project_id,
                expected_version: VersionToken::INITIAL,
            }))
            .await;

        match result {
            Err(DomainError::ConcurrencyConflict { actual, .. }) => assert_eq!(actual, 2),
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }
        assert!(h.sleeper.delays().is_empty());
        assert!(h.db.record("projects", project_id).is_some());
    }

    #[tokio::test]
    async fn test_cancelled_caller_writes_nothing() {
        // Arrange
        let h = harness();
        let (cx, handle) = OperationContext::cancellable();
        handle.cancel();

        // Act
        let result = h
            .bus
            .send(&cx, TaskCommand::CreateWorkspace(CreateWorkspace {
                metadata: metadata(&h.clock),
                workspace_id: Uuid::new_v4(),
                name: "Operations".into(),
            }))
            .await;

        // Assert
        match result {
            Err(DomainError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(h.db.count("workspaces"), 0);
        assert_eq!(h.db.open_transactions(), 0);
        assert!(h.db.event_log().is_empty());
    }

    #[tokio::test]
    async fn test_move_task_records_both_projects() {
        // Arrange
        let h = harness();
        let workspace_id = create_workspace(&h).await;
        let from = create_project(&h, workspace_id).await;
        let to = create_project(&h, workspace_id).await;
        let task_id = create_task(&h, Some(from)).await;

        // Act
        let outcome = h
            .bus
            .send(&h.cx, TaskCommand::MoveTask(MoveTask {
                metadata: metadata(&h.clock),
                task_id,
                expected_version: VersionToken::INITIAL,
                project_id: Some(to),
            }))
            .await
            .unwrap();

        // Assert
        let moved: TaskEventKind = serde_json::from_value(outcome.events[0].payload.clone()).unwrap();
        assert_eq!(
            moved,
            TaskEventKind::TaskMoved(TaskMoved {
                task_id,
                from_project_id: Some(from),
                to_project_id: Some(to),
            })
        );
        let row = h.db.record("tasks", task_id).unwrap();
        assert_eq!(row.get("project_id"), Some(&json!(to.to_string())));
    }

    #[tokio::test]
    async fn test_deleting_a_project_with_tasks_is_rejected() {
        let h = harness();
        let workspace_id = create_workspace(&h).await;
        let project_id = create_project(&h, workspace_id).await;
        create_task(&h, Some(project_id)).await;

        let result = h
            .bus
            .send(&h.cx, TaskCommand::DeleteProject(DeleteProject {
                metadata: metadata(&h.clock),
                project_id,
                expected_version: VersionToken::INITIAL,
            }))
            .await;

        assert!(matches!(result, Err(DomainError::ReferentialIntegrity(_))));
        assert!(h.db.record("projects", project_id).is_some());
    }

    #[tokio::test]
    async fn test_deleting_an_empty_project_succeeds() {
        let h = harness();
        let workspace_id = create_workspace(&h).await;
        let project_id = create_project(&h, workspace_id).await;

        let outcome = h
            .bus
            .send(&h.cx, TaskCommand::DeleteProject(DeleteProject {
                metadata: metadata(&h.clock),
                project_id,
                expected_version: VersionToken::INITIAL,
            }))
            .await
            .unwrap();

        assert_eq!(outcome.version, None);
        assert_eq!(outcome.events[0].event_type, "tasks.project_deleted");
        assert!(h.db.record("projects", project_id).is_none());
        let events = h.db.event_log().get_events(project_id, None).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_command_never_reaches_the_engine() {
        let h = harness();

        let result = h
            .bus
            .send(&h.cx, TaskCommand::CreateTask(CreateTask {
                metadata: metadata(&h.clock),
                task_id: Uuid::new_v4(),
                project_id: None,
                title: "ok".into(),
                priority: 9,
            }))
            .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(h.db.count("tasks"), 0);
    }
}
