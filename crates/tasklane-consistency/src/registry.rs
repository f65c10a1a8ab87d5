//! Tracked entity schema.
//!
//! The registry is data: which tables the engine audits, which column holds
//! each table's version token, which columns reference which parents and
//! what to do with an orphan, and the field rules checked by data
//! validation. It is built in code or deserialized from YAML.

use serde::{Deserialize, Serialize};
use tasklane_core::error::DomainError;

/// Repair applied to a child row whose parent no longer exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Clear the reference. Only valid for nullable columns.
    SetNull,
    /// Delete the child row.
    CascadeDelete,
    /// Report only; never repaired automatically.
    #[default]
    Reject,
}

/// A foreign-key style reference from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRule {
    /// Column in the child table holding the parent id.
    pub column: String,
    /// Entity type of the parent.
    pub target: String,
    /// Whether the column may be NULL.
    #[serde(default)]
    pub nullable: bool,
    /// Repair applied to orphans.
    #[serde(default)]
    pub on_orphan: OrphanPolicy,
}

impl ReferenceRule {
    /// A required reference whose orphans are reported but not repaired.
    #[must_use]
    pub fn new(column: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            target: target.into(),
            nullable: false,
            on_orphan: OrphanPolicy::Reject,
        }
    }

    /// Allows NULL in the reference column.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the orphan repair.
    #[must_use]
    pub fn on_orphan(mut self, policy: OrphanPolicy) -> Self {
        self.on_orphan = policy;
        self
    }
}

/// A schema or range check on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldCheck {
    /// Present, non-null and, for strings, not blank.
    Required,
    /// String length in characters.
    Length {
        /// Inclusive lower bound.
        #[serde(default)]
        min: Option<usize>,
        /// Inclusive upper bound.
        #[serde(default)]
        max: Option<usize>,
    },
    /// Numeric range.
    Range {
        /// Inclusive lower bound.
        #[serde(default)]
        min: Option<f64>,
        /// Inclusive upper bound.
        #[serde(default)]
        max: Option<f64>,
    },
    /// Value must equal one of these.
    OneOf {
        /// Allowed values.
        values: Vec<serde_json::Value>,
    },
    /// String must parse as a UUID.
    Uuid,
}

/// A check bound to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Field (column) name.
    pub field: String,
    /// The check.
    pub check: FieldCheck,
}

impl FieldRule {
    /// `field` must be present and non-blank.
    #[must_use]
    pub fn required(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            check: FieldCheck::Required,
        }
    }

    /// `field` length must fall within the bounds.
    #[must_use]
    pub fn length(field: impl Into<String>, min: Option<usize>, max: Option<usize>) -> Self {
        Self {
            field: field.into(),
            check: FieldCheck::Length { min, max },
        }
    }

    /// `field` must be a number within the bounds.
    #[must_use]
    pub fn range(field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            field: field.into(),
            check: FieldCheck::Range { min, max },
        }
    }

    /// `field` must equal one of `values`.
    #[must_use]
    pub fn one_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<serde_json::Value>,
    {
        Self {
            field: field.into(),
            check: FieldCheck::OneOf {
                values: values.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// `field` must be a UUID string.
    #[must_use]
    pub fn uuid(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            check: FieldCheck::Uuid,
        }
    }
}

/// One tracked entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Name used in violations and reports.
    pub entity_type: String,
    /// Backing table.
    pub table: String,
    /// Column holding the version token, if the entity is versioned.
    #[serde(default)]
    pub version_column: Option<String>,
    /// Outgoing references.
    #[serde(default)]
    pub references: Vec<ReferenceRule>,
    /// Field rules for data validation.
    #[serde(default)]
    pub rules: Vec<FieldRule>,
}

impl EntityDefinition {
    /// An unversioned entity with no references or rules.
    #[must_use]
    pub fn new(entity_type: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            table: table.into(),
            version_column: None,
            references: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Marks the entity as versioned through `column`.
    #[must_use]
    pub fn versioned(mut self, column: impl Into<String>) -> Self {
        self.version_column = Some(column.into());
        self
    }

    /// Adds a reference.
    #[must_use]
    pub fn reference(mut self, rule: ReferenceRule) -> Self {
        self.references.push(rule);
        self
    }

    /// Adds a field rule.
    #[must_use]
    pub fn rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The reference rule declared on `column`.
    #[must_use]
    pub fn reference_on(&self, column: &str) -> Option<&ReferenceRule> {
        self.references.iter().find(|r| r.column == column)
    }
}

/// Whether `name` is usable as a SQL identifier without quoting tricks.
#[must_use]
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The validated set of tracked entities, in audit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RegistryDocument", into = "RegistryDocument")]
pub struct EntityRegistry {
    entities: Vec<EntityDefinition>,
}

/// Serialized form of a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDocument {
    entities: Vec<EntityDefinition>,
}

impl TryFrom<RegistryDocument> for EntityRegistry {
    type Error = DomainError;

    fn try_from(doc: RegistryDocument) -> Result<Self, Self::Error> {
        Self::from_definitions(doc.entities)
    }
}

impl From<EntityRegistry> for RegistryDocument {
    fn from(registry: EntityRegistry) -> Self {
        Self {
            entities: registry.entities,
        }
    }
}

impl EntityRegistry {
    /// Starts an empty registry.
    #[must_use]
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::default()
    }

    /// Validates and wraps a list of definitions.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if an identifier is not SQL-safe, an
    /// entity type or table is declared twice, a reference targets an
    /// unregistered entity, or `SetNull` is declared on a required column.
    pub fn from_definitions(entities: Vec<EntityDefinition>) -> Result<Self, DomainError> {
        let mut seen_types = std::collections::HashSet::new();
        let mut seen_tables = std::collections::HashSet::new();

        for entity in &entities {
            check_identifier(&entity.table)?;
            if let Some(column) = &entity.version_column {
                check_identifier(column)?;
            }
            if !seen_types.insert(entity.entity_type.as_str()) {
                return Err(DomainError::Validation(format!(
                    "entity type {} is registered twice",
                    entity.entity_type
                )));
            }
            if !seen_tables.insert(entity.table.as_str()) {
                return Err(DomainError::Validation(format!(
                    "table {} is registered twice",
                    entity.table
                )));
            }
        }

        for entity in &entities {
            for reference in &entity.references {
                check_identifier(&reference.column)?;
                if !seen_types.contains(reference.target.as_str()) {
                    return Err(DomainError::Validation(format!(
                        "{}.{} references unregistered entity type {}",
                        entity.entity_type, reference.column, reference.target
                    )));
                }
                if reference.on_orphan == OrphanPolicy::SetNull && !reference.nullable {
                    return Err(DomainError::Validation(format!(
                        "{}.{} is not nullable and cannot use set_null",
                        entity.entity_type, reference.column
                    )));
                }
            }
        }

        Ok(Self { entities })
    }

    /// All definitions in registration order.
    #[must_use]
    pub fn entities(&self) -> &[EntityDefinition] {
        &self.entities
    }

    /// Looks up a definition by entity type.
    #[must_use]
    pub fn get(&self, entity_type: &str) -> Option<&EntityDefinition> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }

    /// Looks up a definition, failing for unknown types.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `entity_type` is not registered.
    pub fn require(&self, entity_type: &str) -> Result<&EntityDefinition, DomainError> {
        self.get(entity_type)
            .ok_or_else(|| DomainError::Validation(format!("unknown entity type {entity_type}")))
    }

    /// Every `(child, reference)` pair that points at `entity_type`.
    pub fn children_of<'a>(
        &'a self,
        entity_type: &'a str,
    ) -> impl Iterator<Item = (&'a EntityDefinition, &'a ReferenceRule)> + 'a {
        self.entities.iter().flat_map(move |child| {
            child
                .references
                .iter()
                .filter(move |r| r.target == entity_type)
                .map(move |r| (child, r))
        })
    }
}

fn check_identifier(name: &str) -> Result<(), DomainError> {
    if is_sql_identifier(name) {
        Ok(())
    } else {
        Err(DomainError::Validation(format!(
            "{name:?} is not a valid SQL identifier"
        )))
    }
}

/// Collects definitions for [`EntityRegistry`].
#[derive(Debug, Default)]
pub struct EntityRegistryBuilder {
    entities: Vec<EntityDefinition>,
}

impl EntityRegistryBuilder {
    /// Adds an entity.
    #[must_use]
    pub fn entity(mut self, definition: EntityDefinition) -> Self {
        self.entities.push(definition);
        self
    }

    /// Validates the collected definitions.
    ///
    /// # Errors
    ///
    /// See [`EntityRegistry::from_definitions`].
    pub fn build(self) -> Result<EntityRegistry, DomainError> {
        EntityRegistry::from_definitions(self.entities)
    }
}
