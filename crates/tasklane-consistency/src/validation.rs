//! Data validation: field rules on records and shape checks on raised
//! events.

use serde_json::{Value, json};
use tasklane_core::storage::Record;
use tasklane_core::violation::{ConsistencyViolation, Severity, ViolationType};
use uuid::Uuid;

use crate::registry::{EntityDefinition, FieldCheck, FieldRule};
use crate::transaction::RaisedEvent;

/// Evaluates every field rule of `definition` against `record`.
#[must_use]
pub fn validate_record(definition: &EntityDefinition, record: &Record) -> Vec<ConsistencyViolation> {
    definition
        .rules
        .iter()
        .filter_map(|rule| check_field(definition, record, rule))
        .collect()
}

fn check_field(
    definition: &EntityDefinition,
    record: &Record,
    rule: &FieldRule,
) -> Option<ConsistencyViolation> {
    let value = record.get(&rule.field).unwrap_or(&Value::Null);
    let violation = |message: String, severity: Severity| {
        ConsistencyViolation::new(
            ViolationType::DataValidation,
            &definition.entity_type,
            record.id,
            message,
            severity,
        )
        .with_field(&rule.field)
        .with_actual(value.clone())
    };

    if value.is_null() {
        return matches!(rule.check, FieldCheck::Required)
            .then(|| violation(format!("{} is required", rule.field), Severity::High));
    }

    match &rule.check {
        FieldCheck::Required => value
            .as_str()
            .is_some_and(|s| s.trim().is_empty())
            .then(|| violation(format!("{} must not be blank", rule.field), Severity::High)),
        FieldCheck::Length { min, max } => {
            let Some(text) = value.as_str() else {
                return Some(violation(
                    format!("{} must be a string", rule.field),
                    Severity::Medium,
                ));
            };
            let length = text.chars().count();
            let too_short = min.is_some_and(|min| length < min);
            let too_long = max.is_some_and(|max| length > max);
            (too_short || too_long).then(|| {
                violation(
                    format!("{} length {length} is out of bounds", rule.field),
                    Severity::Medium,
                )
                .with_expected(json!({ "min": min, "max": max }))
            })
        }
        FieldCheck::Range { min, max } => {
            let Some(number) = value.as_f64() else {
                return Some(violation(
                    format!("{} must be a number", rule.field),
                    Severity::Medium,
                ));
            };
            let below = min.is_some_and(|min| number < min);
            let above = max.is_some_and(|max| number > max);
            (below || above).then(|| {
                violation(
                    format!("{} value {number} is out of range", rule.field),
                    Severity::Medium,
                )
                .with_expected(json!({ "min": min, "max": max }))
            })
        }
        FieldCheck::OneOf { values } => (!values.contains(value)).then(|| {
            violation(
                format!("{} is not an allowed value", rule.field),
                Severity::Medium,
            )
            .with_expected(Value::Array(values.clone()))
        }),
        FieldCheck::Uuid => value
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .is_none()
            .then(|| violation(format!("{} is not a UUID", rule.field), Severity::High)),
    }
}

/// Shape checks on events raised during a unit of work.
#[must_use]
pub fn validate_events(events: &[RaisedEvent]) -> Vec<ConsistencyViolation> {
    let mut violations = Vec::new();
    for raised in events {
        let event = &raised.event;
        let violation = |field: &str, message: &str| {
            ConsistencyViolation::new(
                ViolationType::DataValidation,
                "event",
                event.event_id,
                message,
                Severity::High,
            )
            .with_field(field)
        };
        if event.event_type.trim().is_empty() {
            violations.push(violation("event_type", "event type must not be empty"));
        }
        if raised.stream_id.is_nil() {
            violations.push(violation("stream_id", "event stream id must not be nil"));
        }
        if event.payload.is_null() {
            violations.push(violation("payload", "event payload must not be null"));
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::Map;
    use tasklane_core::event_log::PendingEvent;

    use super::*;

    fn task_definition() -> EntityDefinition {
        EntityDefinition::new("tasks", "tasks")
            .rule(FieldRule::required("title"))
            .rule(FieldRule::length("title", Some(1), Some(10)))
            .rule(FieldRule::range("priority", Some(0.0), Some(4.0)))
            .rule(FieldRule::one_of("status", ["todo", "in_progress", "done"]))
            .rule(FieldRule::uuid("project_id"))
    }

    fn task(fields: Value) -> Record {
        let Value::Object(map) = fields else {
            panic!("fields must be an object");
        };
        Record::new(Uuid::new_v4(), map)
    }

    #[test]
    fn test_valid_record_has_no_violations() {
        let record = task(json!({
            "title": "ship it",
            "priority": 2,
            "status": "todo",
            "project_id": Uuid::new_v4().to_string(),
        }));

        assert!(validate_record(&task_definition(), &record).is_empty());
    }

    #[test]
    fn test_optional_fields_may_be_null() {
        let record = task(json!({ "title": "ship it", "project_id": null }));

        assert!(validate_record(&task_definition(), &record).is_empty());
    }

    #[test]
    fn test_each_broken_rule_is_reported() {
        // Arrange
        let record = task(json!({
            "title": "   ",
            "priority": 9,
            "status": "blocked",
            "project_id": "not-a-uuid",
        }));

        // Act
        let violations = validate_record(&task_definition(), &record);

        // Assert
        let fields: Vec<&str> = violations
            .iter()
            .map(|v| v.field.as_deref().unwrap())
            .collect();
        assert_eq!(fields, vec!["title", "priority", "status", "project_id"]);
        assert!(violations
            .iter()
            .all(|v| v.violation_type == ViolationType::DataValidation && !v.auto_fixable));
        assert_eq!(violations[0].severity, Severity::High);
        assert_eq!(violations[1].severity, Severity::Medium);
    }

    #[test]
    fn test_missing_required_field() {
        let record = Record::new(Uuid::new_v4(), Map::new());

        let violations = validate_record(&task_definition(), &record);

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field.as_deref(), Some("title"));
        assert_eq!(violations[0].actual_value, Some(Value::Null));
    }

    #[test]
    fn test_events_with_missing_parts_are_rejected() {
        let event = PendingEvent {
            event_id: Uuid::new_v4(),
            event_type: String::new(),
            payload: Value::Null,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            occurred_at: Utc::now(),
        };
        let raised = RaisedEvent {
            stream_id: Uuid::nil(),
            event,
        };

        let violations = validate_events(&[raised]);

        assert_eq!(violations.len(), 3);
    }
}
