//! Schema adaptation: deriving local table shape from observed fields.
//!
//! The remote field set is discovered per entity type at runtime, so
//! tables are created lazily and grow columns as new fields appear.
//! Identifier sanitization is centralized here; every call site goes
//! through the same mapping so field-to-column naming cannot drift.

use rusqlite::Connection;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use erpsync_common::{EntityType, Error, Result};

/// SQLite keywords that cannot be used as bare column names.
const RESERVED_WORDS: &[&str] = &[
    "abort", "action", "add", "after", "all", "alter", "and", "as", "asc", "between", "by",
    "case", "check", "collate", "column", "commit", "create", "cross", "default", "delete",
    "desc", "distinct", "drop", "else", "end", "escape", "except", "exists", "foreign", "from",
    "group", "having", "in", "index", "inner", "insert", "intersect", "into", "is", "join",
    "key", "left", "like", "limit", "not", "null", "on", "or", "order", "outer", "primary",
    "references", "right", "rollback", "select", "set", "table", "then", "to", "transaction",
    "union", "unique", "update", "values", "when", "where",
];

/// Maps remote field names to storage-safe column names and remote
/// values to storable SQLite values, and manages lazy table creation.
///
/// Column mapping is deterministic and stable across runs: a name that
/// is already a valid identifier passes through unchanged; anything
/// else is rewritten and suffixed with a hash of the original name so
/// two distinct remote fields can never share a column.
#[derive(Debug, Default)]
pub struct SchemaAdapter {
    /// Known columns per table, loaded from the database on first touch.
    known_columns: HashMap<String, HashSet<String>>,
}

impl SchemaAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize a remote field name into a storage identifier.
    pub fn sanitize_column(field: &str) -> String {
        if is_valid_identifier(field) {
            return field.to_string();
        }

        let mut base: String = field
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        if base.is_empty() {
            base.push('f');
        }
        if base.starts_with(|c: char| c.is_ascii_digit()) {
            base.insert_str(0, "f_");
        }
        // Hash of the original name keeps distinct fields distinct even
        // when the character replacement collides.
        format!("{}_{:08x}", base, djb2(field))
    }

    /// Sanitize a remote value into a storable SQLite value.
    ///
    /// Scalars pass through (booleans as 0/1); nested arrays/objects
    /// are serialized to JSON text; null maps to SQL NULL.
    pub fn sanitize_value(value: &Value) -> Result<rusqlite::types::Value> {
        use rusqlite::types::Value as Sql;
        Ok(match value {
            Value::Null => Sql::Null,
            Value::Bool(b) => Sql::Integer(i64::from(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Sql::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Sql::Real(f)
                } else {
                    return Err(Error::Serialization(format!(
                        "Unrepresentable number: {}",
                        n
                    )));
                }
            }
            Value::String(s) => Sql::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Sql::Text(
                serde_json::to_string(value)
                    .map_err(|e| Error::Serialization(e.to_string()))?,
            ),
        })
    }

    /// Revive a stored text value: JSON-looking text is deserialized
    /// back to its structured form, anything else stays a string.
    pub fn revive_text(text: &str) -> Value {
        let trimmed = text.trim_start();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        } else {
            Value::String(text.to_string())
        }
    }

    /// Ensure the entity type's table exists and has a column for every
    /// observed field. Idempotent; columns are only ever added.
    pub fn ensure_table(
        &mut self,
        conn: &Connection,
        entity_type: &EntityType,
        observed_fields: &[String],
    ) -> Result<()> {
        let table = entity_type.table_name();

        if !self.known_columns.contains_key(&table) {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\" (\
                     \"id\" INTEGER PRIMARY KEY, \
                     \"synced_at\" TEXT NOT NULL)",
                    table
                ),
                [],
            )
            .map_err(db_err)?;
            let existing = load_columns(conn, &table)?;
            debug!(%entity_type, table, columns = existing.len(), "table ready");
            self.known_columns.insert(table.clone(), existing);
        }

        let columns = self
            .known_columns
            .get_mut(&table)
            .ok_or_else(|| Error::Storage(format!("missing column cache for {}", table)))?;

        for field in observed_fields {
            if field == "id" {
                continue;
            }
            let column = Self::sanitize_column(field);
            if columns.contains(&column) {
                continue;
            }
            conn.execute(
                &format!("ALTER TABLE \"{}\" ADD COLUMN \"{}\"", table, column),
                [],
            )
            .map_err(db_err)?;
            debug!(%entity_type, column, "added column");
            columns.insert(column);
        }
        Ok(())
    }

    /// Columns currently known for a table (after `ensure_table`).
    pub fn columns(&self, table: &str) -> Option<&HashSet<String>> {
        self.known_columns.get(table)
    }

    /// Drop the cached column set for a table (after the table itself
    /// was dropped or cleared).
    pub fn forget_table(&mut self, table: &str) {
        self.known_columns.remove(table);
    }
}

fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return false;
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return false;
    }
    !RESERVED_WORDS.contains(&name.to_ascii_lowercase().as_str())
}

fn djb2(s: &str) -> u32 {
    s.bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(u32::from(b)))
}

fn load_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{}\")", table))
        .map_err(db_err)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(db_err)?
        .collect::<std::result::Result<HashSet<_>, _>>()
        .map_err(db_err)?;
    Ok(names)
}

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_names_pass_through() {
        assert_eq!(SchemaAdapter::sanitize_column("name"), "name");
        assert_eq!(SchemaAdapter::sanitize_column("write_date"), "write_date");
        assert_eq!(SchemaAdapter::sanitize_column("partner_id"), "partner_id");
    }

    #[test]
    fn test_sanitize_is_stable() {
        let a = SchemaAdapter::sanitize_column("weird.field-name");
        let b = SchemaAdapter::sanitize_column("weird.field-name");
        assert_eq!(a, b);
        assert!(a.starts_with("weird_field_name_"));
    }

    #[test]
    fn test_sanitize_is_collision_free() {
        // Both would naively map to "a_b".
        let a = SchemaAdapter::sanitize_column("a.b");
        let b = SchemaAdapter::sanitize_column("a-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_leading_digit_prefixed() {
        let col = SchemaAdapter::sanitize_column("2fa_enabled");
        assert!(col.starts_with("f_2fa_enabled"));
    }

    #[test]
    fn test_reserved_word_rewritten() {
        let col = SchemaAdapter::sanitize_column("order");
        assert_ne!(col, "order");
        assert!(col.starts_with("order_"));
    }

    #[test]
    fn test_sanitize_value_scalars() {
        use rusqlite::types::Value as Sql;
        assert_eq!(
            SchemaAdapter::sanitize_value(&json!(true)).unwrap(),
            Sql::Integer(1)
        );
        assert_eq!(
            SchemaAdapter::sanitize_value(&json!(42)).unwrap(),
            Sql::Integer(42)
        );
        assert_eq!(
            SchemaAdapter::sanitize_value(&json!(1.5)).unwrap(),
            Sql::Real(1.5)
        );
        assert_eq!(SchemaAdapter::sanitize_value(&json!(null)).unwrap(), Sql::Null);
    }

    #[test]
    fn test_complex_values_roundtrip_through_text() {
        let value = json!({"ids": [1, 2, 3]});
        let stored = SchemaAdapter::sanitize_value(&value).unwrap();
        let rusqlite::types::Value::Text(text) = stored else {
            panic!("expected text storage for object");
        };
        assert_eq!(SchemaAdapter::revive_text(&text), value);
    }

    #[test]
    fn test_revive_plain_text_untouched() {
        assert_eq!(
            SchemaAdapter::revive_text("Azure Interior"),
            json!("Azure Interior")
        );
    }

    #[test]
    fn test_ensure_table_idempotent_and_additive() {
        let conn = Connection::open_in_memory().unwrap();
        let mut schema = SchemaAdapter::new();
        let et = EntityType::new("res.partner").unwrap();

        schema
            .ensure_table(&conn, &et, &["name".into(), "email".into()])
            .unwrap();
        schema
            .ensure_table(&conn, &et, &["name".into(), "phone".into()])
            .unwrap();

        let cols = schema.columns("res_partner").unwrap();
        for expected in ["id", "synced_at", "name", "email", "phone"] {
            assert!(cols.contains(expected), "missing column {}", expected);
        }
    }

    #[test]
    fn test_ensure_table_reloads_existing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        let et = EntityType::new("res.partner").unwrap();

        let mut first = SchemaAdapter::new();
        first
            .ensure_table(&conn, &et, &["name".into()])
            .unwrap();

        // A fresh adapter over the same database must not re-add "name".
        let mut second = SchemaAdapter::new();
        second
            .ensure_table(&conn, &et, &["name".into(), "email".into()])
            .unwrap();
        let cols = second.columns("res_partner").unwrap();
        assert!(cols.contains("name"));
        assert!(cols.contains("email"));
    }
}
