//! Auditor configuration from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tasklane_consistency::{ConsistencyPolicy, EntityRegistry};
use tasklane_tasks::schema::task_registry;
use tracing::info;

use crate::error::AppError;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Everything the auditor reads at startup.
#[derive(Debug, Clone)]
pub struct AuditorConfig {
    /// `PostgreSQL` connection string.
    pub database_url: String,
    /// Pool size.
    pub max_connections: u32,
    /// YAML entity schema; the built-in task schema when unset.
    pub schema_path: Option<PathBuf>,
    /// Pause between audits; `None` runs once.
    pub interval: Option<Duration>,
    /// Apply the bundled migrations before auditing.
    pub run_migrations: bool,
    /// Engine policy.
    pub policy: ConsistencyPolicy,
}

impl AuditorConfig {
    /// Reads the process environment.
    ///
    /// # Errors
    ///
    /// See [`AuditorConfig::from_lookup`].
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when `DATABASE_URL` is missing or any
    /// value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| AppError::Config("DATABASE_URL must be set".into()))?;
        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => parse(&raw, "DATABASE_MAX_CONNECTIONS")?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        let interval = match lookup("AUDIT_INTERVAL_SECS") {
            Some(raw) => match parse::<u64>(&raw, "AUDIT_INTERVAL_SECS")? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            None => None,
        };
        let run_migrations = match lookup("AUDIT_RUN_MIGRATIONS") {
            Some(raw) => parse(&raw, "AUDIT_RUN_MIGRATIONS")?,
            None => false,
        };
        let policy =
            ConsistencyPolicy::from_lookup(&lookup).map_err(|e| AppError::Config(e.to_string()))?;

        Ok(Self {
            database_url,
            max_connections,
            schema_path: lookup("ENTITY_SCHEMA_PATH").map(PathBuf::from),
            interval,
            run_migrations,
            policy,
        })
    }
}

fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| AppError::Config(format!("{key} is invalid ({raw:?}): {e}")))
}

/// Loads the entity schema from YAML, or the built-in task schema.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be read and `AppError::Config`
/// if it is not a valid schema.
pub fn load_registry(path: Option<&Path>) -> Result<EntityRegistry, AppError> {
    let Some(path) = path else {
        return Ok(task_registry()?);
    };
    let yaml = std::fs::read_to_string(path)?;
    let registry = parse_registry(&yaml)
        .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), entities = registry.entities().len(), "entity schema loaded");
    Ok(registry)
}

fn parse_registry(yaml: &str) -> Result<EntityRegistry, serde_yaml::Error> {
    serde_yaml::from_str(yaml)
}
