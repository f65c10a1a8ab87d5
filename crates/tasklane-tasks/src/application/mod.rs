//! Application layer of the task context.

pub mod command_handlers;
pub mod query_handlers;
