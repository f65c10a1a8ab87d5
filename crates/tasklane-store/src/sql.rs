//! Statement builder for registry-driven tables.
//!
//! Table and column names are validated and double-quoted; every value is a
//! bind parameter. Rows travel as JSONB (`to_jsonb` on the way out,
//! `jsonb_populate_record` on the way in) so one set of statements serves
//! every tracked table.

use std::fmt;

use thiserror::Error;

/// A statement could not be built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlBuildError {
    /// A table or column name is not a plain SQL identifier.
    #[error("{0:?} is not a valid SQL identifier")]
    InvalidIdentifier(String),

    /// An update named no columns.
    #[error("update of {0} sets no columns")]
    EmptyUpdate(String),
}

/// A validated, quoted SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident(String);

impl Ident {
    /// Validates `name` against `[A-Za-z_][A-Za-z0-9_]*`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for anything else.
    pub fn new(name: &str) -> Result<Self, SqlBuildError> {
        let mut chars = name.chars();
        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(Self(name.to_owned()))
        } else {
            Err(SqlBuildError::InvalidIdentifier(name.to_owned()))
        }
    }

    /// The unquoted name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

/// Statements over one table. `$1` is always the row id.
#[derive(Debug, Clone)]
pub struct TableSql {
    table: Ident,
}

impl TableSql {
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for an unsafe table name.
    pub fn new(table: &str) -> Result<Self, SqlBuildError> {
        Ok(Self {
            table: Ident::new(table)?,
        })
    }

    /// One row as JSONB in column `row`.
    #[must_use]
    pub fn select_by_id(&self) -> String {
        format!("SELECT to_jsonb(t) AS row FROM {} t WHERE t.id = $1", self.table)
    }

    /// Every row as JSONB, ordered by id.
    #[must_use]
    pub fn select_all(&self) -> String {
        format!("SELECT to_jsonb(t) AS row FROM {} t ORDER BY t.id", self.table)
    }

    /// Inserts the JSONB object bound as `$1`.
    #[must_use]
    pub fn insert(&self) -> String {
        format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1)",
            table = self.table
        )
    }

    /// Overwrites `columns` from the JSONB object bound as `$2`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for an unsafe column or `EmptyUpdate`
    /// when `columns` is empty.
    pub fn update<'c>(
        &self,
        columns: impl IntoIterator<Item = &'c str>,
    ) -> Result<String, SqlBuildError> {
        let assignments = columns
            .into_iter()
            .map(|column| Ident::new(column).map(|c| format!("{c} = r.{c}")))
            .collect::<Result<Vec<_>, _>>()?;
        if assignments.is_empty() {
            return Err(SqlBuildError::EmptyUpdate(self.table.as_str().to_owned()));
        }
        Ok(format!(
            "UPDATE {table} t SET {sets} FROM jsonb_populate_record(NULL::{table}, $2) r WHERE t.id = $1",
            table = self.table,
            sets = assignments.join(", ")
        ))
    }

    #[must_use]
    pub fn delete(&self) -> String {
        format!("DELETE FROM {} WHERE id = $1", self.table)
    }

    /// Increments `column` when it equals `$2`, returning the new value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for an unsafe column.
    pub fn compare_and_increment(&self, column: &str) -> Result<String, SqlBuildError> {
        let column = Ident::new(column)?;
        Ok(format!(
            "UPDATE {table} SET {column} = {column} + 1 WHERE id = $1 AND {column} = $2 RETURNING {column}",
            table = self.table
        ))
    }

    /// The stored value of `column` as `BIGINT`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for an unsafe column.
    pub fn select_version(&self, column: &str) -> Result<String, SqlBuildError> {
        let column = Ident::new(column)?;
        Ok(format!(
            "SELECT {column}::BIGINT AS version FROM {table} WHERE id = $1",
            table = self.table
        ))
    }

    /// Rows whose `column` is NULL, zero or negative.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for an unsafe column.
    pub fn invalid_versions(&self, column: &str) -> Result<String, SqlBuildError> {
        let column = Ident::new(column)?;
        Ok(format!(
            "SELECT id, {column}::BIGINT AS version FROM {table} \
             WHERE {column} IS NULL OR {column} <= 0 ORDER BY id",
            table = self.table
        ))
    }

    /// Rows whose non-null `column` matches no id in `parent`, with the raw
    /// reference as JSONB. Compares as text so malformed references are
    /// found too.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for an unsafe column or parent table.
    pub fn find_orphans(&self, column: &str, parent: &str) -> Result<String, SqlBuildError> {
        let column = Ident::new(column)?;
        let parent = Ident::new(parent)?;
        Ok(format!(
            "SELECT c.id, to_jsonb(c.{column}) AS reference FROM {table} c \
             WHERE c.{column} IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.id::text = c.{column}::text) \
             ORDER BY c.id",
            table = self.table
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_validated_and_quoted() {
        assert_eq!(Ident::new("project_id").unwrap().to_string(), "\"project_id\"");
        assert_eq!(Ident::new("_x1").unwrap().as_str(), "_x1");
        for bad in ["", "1tasks", "tasks; DROP TABLE tasks", "a-b", "tasks\""] {
            assert_eq!(
                Ident::new(bad),
                Err(SqlBuildError::InvalidIdentifier(bad.to_owned()))
            );
        }
    }

    #[test]
    fn test_values_are_always_parameters() {
        let sql = TableSql::new("tasks").unwrap();

        assert_eq!(
            sql.compare_and_increment("version").unwrap(),
            "UPDATE \"tasks\" SET \"version\" = \"version\" + 1 WHERE id = $1 AND \"version\" = $2 RETURNING \"version\""
        );
        assert_eq!(sql.delete(), "DELETE FROM \"tasks\" WHERE id = $1");
    }

    #[test]
    fn test_update_sets_only_named_columns() {
        let sql = TableSql::new("tasks").unwrap();

        let update = sql.update(["title", "status"]).unwrap();

        assert_eq!(
            update,
            "UPDATE \"tasks\" t SET \"title\" = r.\"title\", \"status\" = r.\"status\" \
             FROM jsonb_populate_record(NULL::\"tasks\", $2) r WHERE t.id = $1"
        );
        assert!(matches!(
            sql.update(std::iter::empty()),
            Err(SqlBuildError::EmptyUpdate(_))
        ));
    }

    #[test]
    fn test_orphan_query_rejects_unsafe_parent() {
        let sql = TableSql::new("tasks").unwrap();

        let result = sql.find_orphans("project_id", "projects p; --");

        assert!(matches!(result, Err(SqlBuildError::InvalidIdentifier(_))));
    }

    #[test]
    fn test_unsafe_table_is_rejected() {
        assert!(TableSql::new("tasks t").is_err());
    }
}
