//! Domain layer of the task context.

pub mod aggregates;
pub mod commands;
pub mod events;
