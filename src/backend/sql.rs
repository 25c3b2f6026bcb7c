//! Relational backend contract: table naming and the statements a SQL
//! integration needs, with no driver dependency.
//!
//! A lock-based SQL store maps the transaction protocol onto four
//! statements: select-for-update, insert-if-absent, update-by-id and
//! delete-by-id. The shapes rendered here target PostgreSQL; other dialects
//! differ only in the conflict clause.

use crate::config::ConfigError;

/// Names of the table and columns holding bucket rows.
///
/// Identifiers are validated on construction, since they are interpolated
/// into statement text rather than bound as parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSettings {
    table: String,
    id_column: String,
    state_column: String,
}

impl TableSettings {
    /// The conventional `bucket(id, state)` layout.
    pub fn standard() -> Self {
        TableSettings {
            table: "bucket".to_string(),
            id_column: "id".to_string(),
            state_column: "state".to_string(),
        }
    }

    pub fn new(
        table: impl Into<String>,
        id_column: impl Into<String>,
        state_column: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let table = validated(table.into())?;
        let id_column = validated(id_column.into())?;
        let state_column = validated(state_column.into())?;
        Ok(TableSettings { table, id_column, state_column })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn state_column(&self) -> &str {
        &self.state_column
    }
}

fn validated(ident: String) -> Result<String, ConfigError> {
    let mut chars = ident.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(ident)
    } else {
        Err(ConfigError::InvalidSqlIdentifier(ident))
    }
}

/// The four statements of the relational contract, rendered once at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatements {
    select_for_update: String,
    insert_if_absent: String,
    update_state: String,
    delete: String,
}

impl SqlStatements {
    /// PostgreSQL dialect. The insert claims a row with a null state so the
    /// select-for-update has something to lock; conflicts are ignored,
    /// which is what makes concurrent first access converge on one row.
    pub fn postgres(settings: &TableSettings) -> Self {
        let (table, id, state) =
            (settings.table(), settings.id_column(), settings.state_column());
        SqlStatements {
            select_for_update: format!(
                "SELECT {state} FROM {table} WHERE {id} = $1 FOR UPDATE"
            ),
            insert_if_absent: format!(
                "INSERT INTO {table}({id}, {state}) VALUES($1, NULL) ON CONFLICT({id}) DO NOTHING"
            ),
            update_state: format!("UPDATE {table} SET {state} = $1 WHERE {id} = $2"),
            delete: format!("DELETE FROM {table} WHERE {id} = $1"),
        }
    }

    pub fn select_for_update(&self) -> &str {
        &self.select_for_update
    }

    pub fn insert_if_absent(&self) -> &str {
        &self.insert_if_absent
    }

    pub fn update_state(&self) -> &str {
        &self.update_state
    }

    pub fn delete(&self) -> &str {
        &self.delete
    }
}
