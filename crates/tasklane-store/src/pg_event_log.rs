//! `PostgreSQL` implementation of the `EventLog` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tasklane_core::error::DomainError;
use tasklane_core::event_log::{
    EventLog, EventSnapshot, EventStreamInfo, ExpectedVersion, PendingEvent, StoredEvent,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::map_sqlx_error;

const EVENT_COLUMNS: &str = "event_id, stream_id, event_type, payload, sequence_number, \
     global_position, correlation_id, causation_id, user_id, occurred_at";

fn stored_event(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    Ok(StoredEvent {
        event_id: row.try_get("event_id")?,
        stream_id: row.try_get("stream_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        sequence_number: row.try_get("sequence_number")?,
        global_position: row.try_get("global_position")?,
        correlation_id: row.try_get("correlation_id")?,
        causation_id: row.try_get("causation_id")?,
        user_id: row.try_get("user_id")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

/// Appends `events` to a stream on an open connection.
///
/// The stream row is locked for the rest of the surrounding transaction, so
/// concurrent appends to one stream are serialized in call order.
///
/// # Errors
///
/// Returns `ConcurrencyConflict` when `expected` does not match, or the
/// mapped database error.
pub async fn append_on(
    conn: &mut PgConnection,
    stream_id: Uuid,
    expected: ExpectedVersion,
    events: &[PendingEvent],
) -> Result<Vec<StoredEvent>, DomainError> {
    sqlx::query("INSERT INTO event_streams (stream_id) VALUES ($1) ON CONFLICT (stream_id) DO NOTHING")
        .bind(stream_id)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    let current: i64 =
        sqlx::query_scalar("SELECT version FROM event_streams WHERE stream_id = $1 FOR UPDATE")
            .bind(stream_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;

    if !expected.matches(current) {
        return Err(DomainError::ConcurrencyConflict {
            entity_type: "event_stream".to_owned(),
            aggregate_id: stream_id,
            expected: match expected {
                ExpectedVersion::Exact(v) => v,
                ExpectedVersion::Any => current,
            },
            actual: current,
        });
    }
    if events.is_empty() {
        return Ok(Vec::new());
    }

    let mut stored = Vec::with_capacity(events.len());
    let mut sequence = current;
    for pending in events {
        sequence += 1;
        let global_position: i64 = sqlx::query_scalar(
            r"
            INSERT INTO domain_events (
                event_id, stream_id, event_type, payload, sequence_number,
                correlation_id, causation_id, user_id, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING global_position
            ",
        )
        .bind(pending.event_id)
        .bind(stream_id)
        .bind(&pending.event_type)
        .bind(&pending.payload)
        .bind(sequence)
        .bind(pending.correlation_id)
        .bind(pending.causation_id)
        .bind(pending.user_id)
        .bind(pending.occurred_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
        stored.push(StoredEvent::from_pending(
            stream_id,
            sequence,
            global_position,
            pending.clone(),
        ));
    }

    sqlx::query("UPDATE event_streams SET version = $2, updated_at = NOW() WHERE stream_id = $1")
        .bind(stream_id)
        .bind(sequence)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

    debug!(%stream_id, appended = stored.len(), version = sequence, "events appended");
    Ok(stored)
}

/// PostgreSQL-backed event log.
#[derive(Debug, Clone)]
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    /// Creates a new `PgEventLog`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let stored = append_on(&mut tx, stream_id, expected, &events).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(stored)
    }

    async fn get_events(
        &self,
        stream_id: Uuid,
        from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE stream_id = $1 AND sequence_number > $2 ORDER BY sequence_number"
        ))
        .bind(stream_id)
        .bind(from_version.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter()
            .map(stored_event)
            .collect::<Result<_, _>>()
            .map_err(map_sqlx_error)
    }

    async fn get_all_events(
        &self,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE global_position > $1 ORDER BY global_position"
        ))
        .bind(from_position.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter()
            .map(stored_event)
            .collect::<Result<_, _>>()
            .map_err(map_sqlx_error)
    }

    async fn get_stream_info(
        &self,
        stream_id: Uuid,
    ) -> Result<Option<EventStreamInfo>, DomainError> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS event_count,
                   MAX(sequence_number) AS version,
                   MIN(occurred_at) AS first_event_at,
                   MAX(occurred_at) AS last_event_at
            FROM domain_events
            WHERE stream_id = $1
            ",
        )
        .bind(stream_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let event_count: i64 = row.try_get("event_count").map_err(map_sqlx_error)?;
        if event_count == 0 {
            return Ok(None);
        }
        let version: Option<i64> = row.try_get("version").map_err(map_sqlx_error)?;
        let first: Option<DateTime<Utc>> = row.try_get("first_event_at").map_err(map_sqlx_error)?;
        let last: Option<DateTime<Utc>> = row.try_get("last_event_at").map_err(map_sqlx_error)?;
        match (version, first, last) {
            (Some(version), Some(first_event_at), Some(last_event_at)) => Ok(Some(EventStreamInfo {
                stream_id,
                version,
                event_count,
                first_event_at,
                last_event_at,
            })),
            _ => Err(DomainError::Infrastructure(format!(
                "stream {stream_id} has events but no bounds"
            ))),
        }
    }

    async fn save_snapshot(&self, snapshot: EventSnapshot) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let stream_version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM event_streams WHERE stream_id = $1")
                .bind(snapshot.stream_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        let stream_version = stream_version.unwrap_or(0);
        if snapshot.version < 1 || snapshot.version > stream_version {
            return Err(DomainError::Validation(format!(
                "snapshot version {} is outside stream {} (version {stream_version})",
                snapshot.version, snapshot.stream_id
            )));
        }

        sqlx::query(
            r"
            INSERT INTO event_snapshots (stream_id, version, state, taken_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stream_id) DO UPDATE
                SET version = EXCLUDED.version,
                    state = EXCLUDED.state,
                    taken_at = EXCLUDED.taken_at
                WHERE event_snapshots.version <= EXCLUDED.version
            ",
        )
        .bind(snapshot.stream_id)
        .bind(snapshot.version)
        .bind(&snapshot.state)
        .bind(snapshot.taken_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn get_snapshot(&self, stream_id: Uuid) -> Result<Option<EventSnapshot>, DomainError> {
        let row = sqlx::query(
            "SELECT stream_id, version, state, taken_at FROM event_snapshots WHERE stream_id = $1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| {
            Ok(EventSnapshot {
                stream_id: row.try_get("stream_id")?,
                version: row.try_get("version")?,
                state: row.try_get("state")?,
                taken_at: row.try_get("taken_at")?,
            })
        })
        .transpose()
        .map_err(map_sqlx_error)
    }
}
