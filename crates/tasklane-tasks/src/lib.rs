//! Tasklane workspaces, projects and tasks bounded context.
//!
//! Command handlers route through the command bus into the consistency
//! engine; every mutation is version-guarded, reference-checked and raises
//! events on the aggregate's stream. The query side replays a task's stream
//! into a timeline, starting from its latest snapshot.

pub mod application;
pub mod domain;
pub mod schema;
