//! Tracked entity schema of the task context.

use tasklane_consistency::{
    EntityDefinition, EntityRegistry, FieldRule, OrphanPolicy, ReferenceRule,
};
use tasklane_core::error::DomainError;

use crate::domain::commands::TaskStatus;

/// Entity type of workspaces.
pub const WORKSPACE: &str = "workspaces";
/// Entity type of projects.
pub const PROJECT: &str = "projects";
/// Entity type of tasks.
pub const TASK: &str = "tasks";

/// Highest task priority.
pub const MAX_PRIORITY: i32 = 4;

const NAME_MAX: usize = 120;
const TITLE_MAX: usize = 200;

/// Builds the registry for workspaces, projects and tasks.
///
/// A project cannot exist without its workspace; orphaned projects are
/// deleted by auto-fix. A task may be unfiled; tasks orphaned by a deleted
/// project are unfiled by auto-fix.
///
/// # Errors
///
/// Returns `Validation` if the definitions are inconsistent.
pub fn task_registry() -> Result<EntityRegistry, DomainError> {
    EntityRegistry::builder()
        .entity(
            EntityDefinition::new(WORKSPACE, "workspaces")
                .versioned("version")
                .rule(FieldRule::required("name"))
                .rule(FieldRule::length("name", Some(1), Some(NAME_MAX))),
        )
        .entity(
            EntityDefinition::new(PROJECT, "projects")
                .versioned("version")
                .reference(
                    ReferenceRule::new("workspace_id", WORKSPACE)
                        .on_orphan(OrphanPolicy::CascadeDelete),
                )
                .rule(FieldRule::required("name"))
                .rule(FieldRule::length("name", Some(1), Some(NAME_MAX))),
        )
        .entity(
            EntityDefinition::new(TASK, "tasks")
                .versioned("version")
                .reference(
                    ReferenceRule::new("project_id", PROJECT)
                        .nullable()
                        .on_orphan(OrphanPolicy::SetNull),
                )
                .rule(FieldRule::required("title"))
                .rule(FieldRule::length("title", Some(1), Some(TITLE_MAX)))
                .rule(FieldRule::required("status"))
                .rule(FieldRule::one_of("status", TaskStatus::ALL.map(TaskStatus::as_str)))
                .rule(FieldRule::range(
                    "priority",
                    Some(0.0),
                    Some(f64::from(MAX_PRIORITY)),
                )),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_registry_builds() {
        let registry = task_registry().unwrap();

        let types: Vec<&str> = registry
            .entities()
            .iter()
            .map(|e| e.entity_type.as_str())
            .collect();
        assert_eq!(types, vec![WORKSPACE, PROJECT, TASK]);
    }

    #[test]
    fn test_relationships_carry_their_orphan_policies() {
        let registry = task_registry().unwrap();

        let project = registry.require(PROJECT).unwrap();
        let task = registry.require(TASK).unwrap();

        let workspace_ref = project.reference_on("workspace_id").unwrap();
        assert!(!workspace_ref.nullable);
        assert_eq!(workspace_ref.on_orphan, OrphanPolicy::CascadeDelete);
        let project_ref = task.reference_on("project_id").unwrap();
        assert!(project_ref.nullable);
        assert_eq!(project_ref.on_orphan, OrphanPolicy::SetNull);
    }
}
