//! Integration tests for `PgEventLog`. Require `DATABASE_URL`.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tasklane_core::error::DomainError;
use tasklane_core::event_log::{EventLog, EventSnapshot, ExpectedVersion, PendingEvent};
use tasklane_store::PgEventLog;
use uuid::Uuid;

fn pending(event_type: &str) -> PendingEvent {
    PendingEvent {
        event_id: Uuid::new_v4(),
        event_type: event_type.to_owned(),
        payload: json!({ "key": "value" }),
        correlation_id: Some(Uuid::new_v4()),
        causation_id: None,
        user_id: None,
        occurred_at: Utc::now(),
    }
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL instance"]
async fn test_get_events_is_empty_for_unknown_stream(pool: PgPool) {
    let log = PgEventLog::new(pool);

    let events = log.get_events(Uuid::new_v4(), None).await.unwrap();

    assert!(events.is_empty());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL instance"]
async fn test_append_assigns_contiguous_sequence_numbers(pool: PgPool) {
    // Arrange
    let log = PgEventLog::new(pool);
    let stream = Uuid::new_v4();

    // Act
    let first = log
        .append(stream, ExpectedVersion::Exact(0), vec![pending("a"), pending("b")])
        .await
        .unwrap();
    let second = log
        .append(stream, ExpectedVersion::Exact(2), vec![pending("c")])
        .await
        .unwrap();

    // Assert
    let sequences: Vec<i64> = first.iter().chain(&second).map(|e| e.sequence_number).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(first[0].global_position < first[1].global_position);
    assert!(first[1].global_position < second[0].global_position);
    let loaded = log.get_events(stream, Some(1)).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].event_type, "b");
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL instance"]
async fn test_stale_expected_version_conflicts(pool: PgPool) {
    let log = PgEventLog::new(pool);
    let stream = Uuid::new_v4();
    log.append(stream, ExpectedVersion::Exact(0), vec![pending("a")])
        .await
        .unwrap();

    let result = log
        .append(stream, ExpectedVersion::Exact(0), vec![pending("b")])
        .await;

    match result {
        Err(DomainError::ConcurrencyConflict {
            entity_type,
            expected,
            actual,
            ..
        }) => {
            assert_eq!(entity_type, "event_stream");
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }
    assert_eq!(log.get_events(stream, None).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL instance"]
async fn test_get_all_events_orders_across_streams(pool: PgPool) {
    let log = PgEventLog::new(pool);
    let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
    log.append(s1, ExpectedVersion::Any, vec![pending("a")]).await.unwrap();
    log.append(s2, ExpectedVersion::Any, vec![pending("b")]).await.unwrap();
    log.append(s1, ExpectedVersion::Any, vec![pending("c")]).await.unwrap();

    let all = log.get_all_events(None).await.unwrap();
    let after_first = log.get_all_events(Some(all[0].global_position)).await.unwrap();

    let types: Vec<&str> = all.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["a", "b", "c"]);
    assert_eq!(after_first.len(), 2);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL instance"]
async fn test_stream_info_reflects_appended_events(pool: PgPool) {
    let log = PgEventLog::new(pool);
    let stream = Uuid::new_v4();
    assert!(log.get_stream_info(stream).await.unwrap().is_none());
    log.append(stream, ExpectedVersion::Any, vec![pending("a"), pending("b")])
        .await
        .unwrap();

    let info = log.get_stream_info(stream).await.unwrap().unwrap();

    assert_eq!(info.version, 2);
    assert_eq!(info.event_count, 2);
    assert!(info.first_event_at <= info.last_event_at);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL instance"]
async fn test_snapshot_beyond_stream_version_is_rejected(pool: PgPool) {
    let log = PgEventLog::new(pool);
    let stream = Uuid::new_v4();
    log.append(stream, ExpectedVersion::Any, vec![pending("a")]).await.unwrap();

    let result = log
        .save_snapshot(EventSnapshot {
            stream_id: stream,
            version: 5,
            state: json!({}),
            taken_at: Utc::now(),
        })
        .await;

    assert!(matches!(result, Err(DomainError::Validation(_))));
    assert!(log.get_snapshot(stream).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL instance"]
async fn test_older_snapshot_does_not_replace_newer(pool: PgPool) {
    let log = PgEventLog::new(pool);
    let stream = Uuid::new_v4();
    log.append(stream, ExpectedVersion::Any, vec![pending("a"), pending("b")])
        .await
        .unwrap();
    for version in [2, 1] {
        log.save_snapshot(EventSnapshot {
            stream_id: stream,
            version,
            state: json!({ "v": version }),
            taken_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    let snapshot = log.get_snapshot(stream).await.unwrap().unwrap();

    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.state, json!({ "v": 2 }));
}
