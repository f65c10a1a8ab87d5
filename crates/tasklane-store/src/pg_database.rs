//! `PostgreSQL` implementation of the storage abstraction.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tasklane_core::error::DomainError;
use tasklane_core::event_log::{ExpectedVersion, PendingEvent, StoredEvent};
use tasklane_core::storage::{
    Database, IsolationLevel, LockDiagnostics, LongRunningTransaction, OrphanRow, Record,
    StorageTransaction, VersionCas,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::map_sqlx_error;
use crate::pg_event_log::append_on;
use crate::sql::TableSql;

/// Pool-backed [`Database`].
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns `Infrastructure` when a migration fails.
    pub async fn migrate(&self) -> Result<(), DomainError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DomainError::Infrastructure(format!("migration failed: {e}")))
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn StorageTransaction>, DomainError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        debug!(%isolation, "transaction opened");
        Ok(Box::new(PgTransaction {
            tx: Some(tx),
            isolation,
        }))
    }
}

/// An open `PostgreSQL` transaction. `None` once committed or rolled back.
struct PgTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    isolation: IsolationLevel,
}

impl PgTransaction {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, DomainError> {
        self.tx
            .as_mut()
            .ok_or_else(|| DomainError::Infrastructure("transaction already finished".into()))
    }
}

fn record_from_json(table: &str, value: Value) -> Result<Record, DomainError> {
    let Value::Object(fields) = value else {
        return Err(DomainError::Infrastructure(format!(
            "{table} row is not a JSON object"
        )));
    };
    let id = fields
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| DomainError::Infrastructure(format!("{table} row has no uuid id")))?;
    Ok(Record::new(id, fields))
}

#[async_trait]
impl StorageTransaction for PgTransaction {
    fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    async fn fetch_record(&mut self, table: &str, id: Uuid) -> Result<Option<Record>, DomainError> {
        let sql = TableSql::new(table)?.select_by_id();
        let tx = self.open()?;
        let row: Option<Value> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|value| record_from_json(table, value)).transpose()
    }

    async fn list_records(&mut self, table: &str) -> Result<Vec<Record>, DomainError> {
        let sql = TableSql::new(table)?.select_all();
        let tx = self.open()?;
        let rows: Vec<Value> = sqlx::query_scalar(&sql)
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter()
            .map(|value| record_from_json(table, value))
            .collect()
    }

    async fn insert_record(&mut self, table: &str, record: &Record) -> Result<(), DomainError> {
        let sql = TableSql::new(table)?.insert();
        let mut fields = record.fields.clone();
        fields.insert("id".to_owned(), Value::String(record.id.to_string()));
        let tx = self.open()?;
        sqlx::query(&sql)
            .bind(Value::Object(fields))
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn update_fields(
        &mut self,
        table: &str,
        id: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<bool, DomainError> {
        let sql = TableSql::new(table)?.update(fields.keys().map(String::as_str))?;
        let tx = self.open()?;
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(Value::Object(fields.clone()))
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_record(&mut self, table: &str, id: Uuid) -> Result<bool, DomainError> {
        let sql = TableSql::new(table)?.delete();
        let tx = self.open()?;
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_increment(
        &mut self,
        table: &str,
        version_column: &str,
        id: Uuid,
        expected: i64,
    ) -> Result<VersionCas, DomainError> {
        let sql = TableSql::new(table)?;
        let cas = sql.compare_and_increment(version_column)?;
        let current = sql.select_version(version_column)?;
        let tx = self.open()?;

        let incremented: Option<i64> = sqlx::query_scalar(&cas)
            .bind(id)
            .bind(expected)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        if let Some(version) = incremented {
            return Ok(VersionCas::Incremented(version));
        }

        let actual: Option<Option<i64>> = sqlx::query_scalar(&current)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(VersionCas::Mismatch {
            actual: actual.flatten(),
        })
    }

    async fn invalid_versions(
        &mut self,
        table: &str,
        version_column: &str,
    ) -> Result<Vec<(Uuid, Option<i64>)>, DomainError> {
        let sql = TableSql::new(table)?.invalid_versions(version_column)?;
        let tx = self.open()?;
        let rows = sqlx::query(&sql)
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| Ok((row.try_get("id")?, row.try_get("version")?)))
            .collect::<Result<_, sqlx::Error>>()
            .map_err(map_sqlx_error)
    }

    async fn find_orphans(
        &mut self,
        child_table: &str,
        column: &str,
        parent_table: &str,
    ) -> Result<Vec<OrphanRow>, DomainError> {
        let sql = TableSql::new(child_table)?.find_orphans(column, parent_table)?;
        let tx = self.open()?;
        let rows = sqlx::query(&sql)
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| {
                Ok(OrphanRow {
                    child_id: row.try_get("id")?,
                    reference: row.try_get("reference")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(map_sqlx_error)
    }

    async fn append_events(
        &mut self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: &[PendingEvent],
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let tx = self.open()?;
        append_on(tx, stream_id, expected, events).await
    }

    async fn blocked_waiters(&mut self) -> Result<i64, DomainError> {
        let tx = self.open()?;
        sqlx::query_scalar("SELECT COUNT(*) FROM pg_locks WHERE NOT granted")
            .fetch_one(&mut **tx)
            .await
            .map_err(map_sqlx_error)
    }

    async fn lock_diagnostics(
        &mut self,
        threshold: Duration,
    ) -> Result<LockDiagnostics, DomainError> {
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        let blocked_waiters = self.blocked_waiters().await?;
        let tx = self.open()?;

        let rows = sqlx::query(
            r"
            SELECT pid, state, age_ms FROM (
                SELECT pid,
                       COALESCE(state, 'unknown') AS state,
                       (EXTRACT(EPOCH FROM (clock_timestamp() - xact_start)) * 1000)::BIGINT AS age_ms
                FROM pg_stat_activity
                WHERE xact_start IS NOT NULL AND pid <> pg_backend_pid()
            ) a
            WHERE age_ms > $1
            ORDER BY age_ms DESC
            ",
        )
        .bind(threshold_ms)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        let long_running = rows
            .iter()
            .map(|row| {
                let pid: i32 = row.try_get("pid")?;
                Ok(LongRunningTransaction {
                    holder: format!("pid:{pid}"),
                    age_ms: row.try_get("age_ms")?,
                    state: row.try_get("state")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(map_sqlx_error)?;

        Ok(LockDiagnostics {
            blocked_waiters,
            long_running,
        })
    }

    async fn commit(&mut self) -> Result<(), DomainError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DomainError::Infrastructure("transaction already finished".into()))?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(&mut self) -> Result<(), DomainError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(map_sqlx_error),
            None => Ok(()),
        }
    }
}
