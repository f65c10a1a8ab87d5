//! `PostgreSQL` adapters for the Tasklane consistency engine.
//!
//! [`pg_database::PgDatabase`] implements the transactional storage trait
//! over registry-driven tables; [`pg_event_log::PgEventLog`] implements the
//! append-only event log. Both share the schema in `migrations/`.

pub mod error;
pub mod pg_database;
pub mod pg_event_log;
pub mod sql;

pub use error::map_sqlx_error;
pub use pg_database::PgDatabase;
pub use pg_event_log::PgEventLog;
