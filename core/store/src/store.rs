//! SQLite-backed local store.

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use serde_json::{Number, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use erpsync_common::{EntityType, Error, Record, RecordId, Result, ServerTimestamp};

use crate::checkpoint::Checkpoint;
use crate::schema::{db_err, SchemaAdapter};

pub(crate) struct StoreInner {
    pub(crate) conn: Connection,
    pub(crate) schema: SchemaAdapter,
}

/// Local embedded database: entity tables, checkpoints, offline queue.
///
/// A single connection behind one lock; "read rows, compute diff, write
/// rows" sequences hold the lock for their duration so writers of the
/// same table never interleave.
pub struct LocalStore {
    inner: Mutex<StoreInner>,
}

impl LocalStore {
    /// Create or open a store database file.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                entity_type TEXT PRIMARY KEY,
                last_sync_timestamp TEXT,
                last_sync_write_date TEXT,
                total_records INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_error TEXT,
                sync_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS offline_queue (
                id TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                record_id INTEGER,
                payload TEXT NOT NULL,
                base_write_date TEXT,
                enqueued_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                status TEXT NOT NULL,
                last_error TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_dedup
                ON offline_queue(operation, entity_type, record_id, payload)
                WHERE status IN ('pending', 'processing');

            CREATE INDEX IF NOT EXISTS idx_queue_status
                ON offline_queue(status, enqueued_at);
            "#,
        )
        .map_err(db_err)?;

        // Rows stuck in 'processing' belong to a drain that died
        // mid-flight; put them back in line so the next drain replays
        // them instead of leaving them invisible to the queue (and
        // occupying their dedup slot).
        let recovered = conn
            .execute(
                "UPDATE offline_queue SET status = 'pending' WHERE status = 'processing'",
                [],
            )
            .map_err(db_err)?;
        if recovered > 0 {
            info!(count = recovered, "requeued in-flight mutations from a previous session");
        }

        info!("local store opened");
        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                schema: SchemaAdapter::new(),
            }),
        })
    }

    pub(crate) fn locked(&self) -> MutexGuard<'_, StoreInner> {
        // A poisoned lock means a previous holder panicked; the
        // connection itself is still consistent, every statement runs
        // to completion or not at all.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or overwrite records for an entity type, creating the
    /// table and any new columns lazily. Records must carry an `id`.
    pub fn upsert_records(&self, entity_type: &EntityType, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut guard = self.locked();
        let StoreInner { conn, schema } = &mut *guard;

        let mut observed: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for record in records {
            for name in record.field_names() {
                if seen.insert(name.clone()) {
                    observed.push(name);
                }
            }
        }
        schema.ensure_table(conn, entity_type, &observed)?;

        let table = entity_type.table_name();
        let synced_at = ServerTimestamp::now().to_string();
        let tx = conn.transaction().map_err(db_err)?;
        let mut written = 0;

        for record in records {
            let id = record.id().ok_or_else(|| {
                Error::InvalidInput(format!("record for {} has no id", entity_type))
            })?;

            let mut columns = vec!["\"id\"".to_string(), "\"synced_at\"".to_string()];
            let mut values: Vec<rusqlite::types::Value> = vec![
                rusqlite::types::Value::Integer(id),
                rusqlite::types::Value::Text(synced_at.clone()),
            ];
            for (field, value) in record.fields() {
                if field == "id" {
                    continue;
                }
                columns.push(format!("\"{}\"", SchemaAdapter::sanitize_column(field)));
                values.push(SchemaAdapter::sanitize_value(value)?);
            }

            let placeholders: Vec<String> =
                (1..=values.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT OR REPLACE INTO \"{}\" ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders.join(", ")
            );
            tx.execute(&sql, rusqlite::params_from_iter(values))
                .map_err(db_err)?;
            written += 1;
        }

        tx.commit().map_err(db_err)?;
        debug!(%entity_type, written, "upserted records");
        Ok(written)
    }

    /// Read a single record by id. Null columns are omitted; JSON text
    /// values are revived to structured form.
    pub fn get_record(
        &self,
        entity_type: &EntityType,
        id: RecordId,
    ) -> Result<Option<Record>> {
        let guard = self.locked();
        let table = entity_type.table_name();
        if !table_exists(&guard.conn, &table)? {
            return Ok(None);
        }
        let mut stmt = guard
            .conn
            .prepare(&format!("SELECT * FROM \"{}\" WHERE id = ?1", table))
            .map_err(db_err)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = stmt.query(params![id]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(Some(row_to_record(row, &column_names)?)),
            None => Ok(None),
        }
    }

    /// All locally stored records for an entity type.
    pub fn list_records(&self, entity_type: &EntityType) -> Result<Vec<Record>> {
        let guard = self.locked();
        let table = entity_type.table_name();
        if !table_exists(&guard.conn, &table)? {
            return Ok(Vec::new());
        }
        let mut stmt = guard
            .conn
            .prepare(&format!("SELECT * FROM \"{}\" ORDER BY id", table))
            .map_err(db_err)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = stmt.query([]).map_err(db_err)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            records.push(row_to_record(row, &column_names)?);
        }
        Ok(records)
    }

    /// Ids of all locally stored records for an entity type.
    pub fn list_ids(&self, entity_type: &EntityType) -> Result<Vec<RecordId>> {
        let guard = self.locked();
        let table = entity_type.table_name();
        if !table_exists(&guard.conn, &table)? {
            return Ok(Vec::new());
        }
        let mut stmt = guard
            .conn
            .prepare(&format!("SELECT id FROM \"{}\" ORDER BY id", table))
            .map_err(db_err)?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    /// Count locally stored records for an entity type.
    pub fn count_records(&self, entity_type: &EntityType) -> Result<u64> {
        let guard = self.locked();
        let table = entity_type.table_name();
        if !table_exists(&guard.conn, &table)? {
            return Ok(0);
        }
        let count: i64 = guard
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
                row.get(0)
            })
            .map_err(db_err)?;
        Ok(count as u64)
    }

    /// Delete specific records.
    pub fn delete_records(&self, entity_type: &EntityType, ids: &[RecordId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let guard = self.locked();
        let table = entity_type.table_name();
        if !table_exists(&guard.conn, &table)? {
            return Ok(0);
        }
        let id_list = join_ids(ids.iter().copied());
        let deleted = guard
            .conn
            .execute(
                &format!("DELETE FROM \"{}\" WHERE id IN ({})", table, id_list),
                [],
            )
            .map_err(db_err)?;
        Ok(deleted)
    }

    /// Delete every local row whose id is not in `keep`, returning the
    /// number pruned. Used after full pulls to drop server-deleted rows.
    pub fn retain_only(
        &self,
        entity_type: &EntityType,
        keep: &HashSet<RecordId>,
    ) -> Result<usize> {
        let guard = self.locked();
        let table = entity_type.table_name();
        if !table_exists(&guard.conn, &table)? {
            return Ok(0);
        }
        let pruned = if keep.is_empty() {
            guard
                .conn
                .execute(&format!("DELETE FROM \"{}\"", table), [])
                .map_err(db_err)?
        } else {
            let id_list = join_ids(keep.iter().copied());
            guard
                .conn
                .execute(
                    &format!("DELETE FROM \"{}\" WHERE id NOT IN ({})", table, id_list),
                    [],
                )
                .map_err(db_err)?
        };
        if pruned > 0 {
            debug!(%entity_type, pruned, "pruned stale rows");
        }
        Ok(pruned)
    }

    /// Remove all rows and the checkpoint for an entity type.
    pub fn clear_entity(&self, entity_type: &EntityType) -> Result<()> {
        let mut guard = self.locked();
        let table = entity_type.table_name();
        if table_exists(&guard.conn, &table)? {
            guard
                .conn
                .execute(&format!("DROP TABLE \"{}\"", table), [])
                .map_err(db_err)?;
        }
        guard
            .conn
            .execute(
                "DELETE FROM sync_metadata WHERE entity_type = ?1",
                params![entity_type.as_str()],
            )
            .map_err(db_err)?;
        guard.schema.forget_table(&table);
        info!(%entity_type, "cleared entity data");
        Ok(())
    }

    /// Load the checkpoint for an entity type, if one exists.
    pub fn get_checkpoint(&self, entity_type: &EntityType) -> Result<Option<Checkpoint>> {
        let guard = self.locked();
        let mut stmt = guard
            .conn
            .prepare(
                "SELECT entity_type, last_sync_timestamp, last_sync_write_date, \
                 total_records, enabled, last_error, sync_count \
                 FROM sync_metadata WHERE entity_type = ?1",
            )
            .map_err(db_err)?;
        let result = stmt.query_row(params![entity_type.as_str()], row_to_checkpoint);
        match result {
            Ok(cp) => Ok(Some(cp?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// All stored checkpoints.
    pub fn all_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let guard = self.locked();
        let mut stmt = guard
            .conn
            .prepare(
                "SELECT entity_type, last_sync_timestamp, last_sync_write_date, \
                 total_records, enabled, last_error, sync_count \
                 FROM sync_metadata ORDER BY entity_type",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], row_to_checkpoint)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().collect()
    }

    /// Persist a checkpoint. The stored `last_sync_write_date` never
    /// regresses: an older incoming mark is replaced by the stored one.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let stored_mark = self
            .get_checkpoint(&checkpoint.entity_type)?
            .and_then(|cp| cp.last_sync_write_date);
        let mark = match (stored_mark, checkpoint.last_sync_write_date) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let guard = self.locked();
        guard
            .conn
            .execute(
                "INSERT OR REPLACE INTO sync_metadata \
                 (entity_type, last_sync_timestamp, last_sync_write_date, \
                  total_records, enabled, last_error, sync_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    checkpoint.entity_type.as_str(),
                    checkpoint.last_sync_timestamp.map(|t| t.to_string()),
                    mark.map(|t| t.to_string()),
                    checkpoint.total_records as i64,
                    checkpoint.enabled as i32,
                    checkpoint.last_error,
                    checkpoint.sync_count as i64,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Flip the enabled flag for an entity type's checkpoint, creating
    /// the checkpoint row if absent.
    pub fn set_enabled(&self, entity_type: &EntityType, enabled: bool) -> Result<()> {
        let mut checkpoint = self
            .get_checkpoint(entity_type)?
            .unwrap_or_else(|| Checkpoint::new(entity_type.clone()));
        checkpoint.enabled = enabled;
        self.save_checkpoint(&checkpoint)
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok(count > 0)
}

fn join_ids(ids: impl Iterator<Item = RecordId>) -> String {
    ids.map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
}

fn row_to_record(row: &rusqlite::Row<'_>, column_names: &[String]) -> Result<Record> {
    let mut record = Record::new();
    for (index, name) in column_names.iter().enumerate() {
        let value = match row.get_ref(index).map_err(db_err)? {
            ValueRef::Null => continue,
            ValueRef::Integer(i) => Value::Number(Number::from(i)),
            ValueRef::Real(f) => Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(text) => {
                let text = std::str::from_utf8(text)
                    .map_err(|e| Error::Corrupt(format!("non-utf8 text in {}: {}", name, e)))?;
                SchemaAdapter::revive_text(text)
            }
            // Blob columns never round-trip; they are excluded upstream.
            ValueRef::Blob(_) => continue,
        };
        record.set(name.clone(), value);
    }
    Ok(record)
}

type SqliteResult<T> = std::result::Result<T, rusqlite::Error>;

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> SqliteResult<Result<Checkpoint>> {
    let entity_type: String = row.get(0)?;
    let last_sync_timestamp: Option<String> = row.get(1)?;
    let last_sync_write_date: Option<String> = row.get(2)?;
    let total_records: i64 = row.get(3)?;
    let enabled: i32 = row.get(4)?;
    let last_error: Option<String> = row.get(5)?;
    let sync_count: i64 = row.get(6)?;

    Ok((|| {
        Ok(Checkpoint {
            entity_type: EntityType::new(entity_type)?,
            last_sync_timestamp: last_sync_timestamp
                .as_deref()
                .map(ServerTimestamp::parse)
                .transpose()?,
            last_sync_write_date: last_sync_write_date
                .as_deref()
                .map(ServerTimestamp::parse)
                .transpose()?,
            total_records: total_records as u64,
            enabled: enabled != 0,
            last_error,
            sync_count: sync_count as u64,
        })
    })())
}
