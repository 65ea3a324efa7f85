//! Durable persistence for the offline mutation queue.
//!
//! Row shape and the dedup uniqueness constraint live in
//! `store.rs` schema init; the operations here are the single-writer
//! primitives the queue logic builds on. The dedup-check-then-insert
//! sequence runs under the store's connection lock, so at most one
//! pending-or-processing row can exist per
//! `(operation, entity_type, record_id, payload)` tuple.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use erpsync_common::{EntityType, Error, Record, RecordId, Result, ServerTimestamp};

use crate::schema::db_err;
use crate::store::LocalStore;

/// Remote operation a queued mutation will perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(MutationOp::Create),
            "update" => Ok(MutationOp::Update),
            "delete" => Ok(MutationOp::Delete),
            other => Err(Error::Corrupt(format!("unknown mutation op '{}'", other))),
        }
    }
}

/// Lifecycle status of a queued mutation.
///
/// `Failed` is terminal: it re-enters the pipeline only through an
/// explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Processing => "processing",
            MutationStatus::Completed => "completed",
            MutationStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "processing" => Ok(MutationStatus::Processing),
            "completed" => Ok(MutationStatus::Completed),
            "failed" => Ok(MutationStatus::Failed),
            other => Err(Error::Corrupt(format!("unknown status '{}'", other))),
        }
    }

    /// Pending or processing: counted for deduplication.
    pub fn is_active(&self) -> bool {
        matches!(self, MutationStatus::Pending | MutationStatus::Processing)
    }
}

/// A pending local write that could not be applied immediately.
///
/// Retry state is part of the persisted record, re-written after each
/// attempt, so it survives a crash mid-drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: String,
    pub operation: MutationOp,
    pub entity_type: EntityType,
    pub record_id: Option<RecordId>,
    pub payload: Record,
    /// Remote write_date known when the mutation was enqueued; the
    /// conflict check at push time compares against this.
    pub base_write_date: Option<ServerTimestamp>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: MutationStatus,
    pub last_error: Option<String>,
}

impl QueuedMutation {
    /// Build a fresh pending mutation with a derived id.
    pub fn new(
        operation: MutationOp,
        entity_type: EntityType,
        payload: Record,
        record_id: Option<RecordId>,
        base_write_date: Option<ServerTimestamp>,
        max_retries: u32,
    ) -> Self {
        let enqueued_at = Utc::now();
        let id = format!(
            "{}:{}:{}:{}",
            entity_type,
            operation.as_str(),
            record_id.map_or_else(|| "new".to_string(), |id| id.to_string()),
            Uuid::new_v4().simple(),
        );
        Self {
            id,
            operation,
            entity_type,
            record_id,
            payload,
            base_write_date,
            enqueued_at,
            retry_count: 0,
            max_retries,
            status: MutationStatus::Pending,
            last_error: None,
        }
    }

    /// Canonical payload text used for deduplication.
    pub fn payload_text(&self) -> Result<String> {
        serde_json::to_string(&self.payload).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl LocalStore {
    /// Persist a new mutation row. Fails on id collision.
    pub fn insert_mutation(&self, mutation: &QueuedMutation) -> Result<()> {
        let payload = mutation.payload_text()?;
        let guard = self.locked();
        guard
            .conn
            .execute(
                "INSERT INTO offline_queue \
                 (id, operation, entity_type, record_id, payload, base_write_date, \
                  enqueued_at, retry_count, max_retries, status, last_error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    mutation.id,
                    mutation.operation.as_str(),
                    mutation.entity_type.as_str(),
                    mutation.record_id,
                    payload,
                    mutation.base_write_date.map(|t| t.to_string()),
                    mutation.enqueued_at.to_rfc3339(),
                    mutation.retry_count,
                    mutation.max_retries,
                    mutation.status.as_str(),
                    mutation.last_error,
                ],
            )
            .map_err(db_err)?;
        debug!(id = %mutation.id, "queued mutation persisted");
        Ok(())
    }

    /// Find an active (pending/processing) mutation with the same
    /// operation, entity type, record id, and payload.
    pub fn find_active_duplicate(
        &self,
        operation: MutationOp,
        entity_type: &EntityType,
        record_id: Option<RecordId>,
        payload_text: &str,
    ) -> Result<Option<String>> {
        let guard = self.locked();
        let result = guard.conn.query_row(
            "SELECT id FROM offline_queue \
             WHERE operation = ?1 AND entity_type = ?2 \
               AND record_id IS ?3 AND payload = ?4 \
               AND status IN ('pending', 'processing') \
             LIMIT 1",
            params![operation.as_str(), entity_type.as_str(), record_id, payload_text],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Load a mutation by id.
    pub fn get_mutation(&self, id: &str) -> Result<Option<QueuedMutation>> {
        let guard = self.locked();
        let mut stmt = guard
            .conn
            .prepare(&format!("{} WHERE id = ?1", SELECT_MUTATION))
            .map_err(db_err)?;
        let result = stmt.query_row(params![id], row_to_mutation);
        match result {
            Ok(m) => Ok(Some(m?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Re-persist a mutation's mutable state (status, retries, error).
    pub fn update_mutation(&self, mutation: &QueuedMutation) -> Result<()> {
        let guard = self.locked();
        let updated = guard
            .conn
            .execute(
                "UPDATE offline_queue \
                 SET status = ?2, retry_count = ?3, last_error = ?4 \
                 WHERE id = ?1",
                params![
                    mutation.id,
                    mutation.status.as_str(),
                    mutation.retry_count,
                    mutation.last_error,
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("queued mutation {}", mutation.id)));
        }
        Ok(())
    }

    /// Pending mutations in enqueue order (oldest first), optionally
    /// restricted to one entity type.
    pub fn load_pending_mutations(
        &self,
        entity_type: Option<&EntityType>,
    ) -> Result<Vec<QueuedMutation>> {
        let guard = self.locked();
        let (sql, filter): (String, Option<&str>) = match entity_type {
            Some(et) => (
                format!(
                    "{} WHERE status = 'pending' AND entity_type = ?1 ORDER BY enqueued_at, id",
                    SELECT_MUTATION
                ),
                Some(et.as_str()),
            ),
            None => (
                format!("{} WHERE status = 'pending' ORDER BY enqueued_at, id", SELECT_MUTATION),
                None,
            ),
        };
        let mut stmt = guard.conn.prepare(&sql).map_err(db_err)?;
        let rows: Vec<_> = match filter {
            Some(et) => stmt
                .query_map(params![et], row_to_mutation)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?,
            None => stmt
                .query_map([], row_to_mutation)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?,
        };
        rows.into_iter().collect()
    }

    /// All mutations, newest first (for inspection tooling).
    pub fn load_all_mutations(&self) -> Result<Vec<QueuedMutation>> {
        let guard = self.locked();
        let mut stmt = guard
            .conn
            .prepare(&format!("{} ORDER BY enqueued_at DESC, id DESC", SELECT_MUTATION))
            .map_err(db_err)?;
        let rows: Vec<_> = stmt
            .query_map([], row_to_mutation)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().collect()
    }

    /// Non-terminal mutations (pending/processing), for backup snapshots.
    pub fn load_active_mutations(&self) -> Result<Vec<QueuedMutation>> {
        let guard = self.locked();
        let mut stmt = guard
            .conn
            .prepare(&format!(
                "{} WHERE status IN ('pending', 'processing') ORDER BY enqueued_at, id",
                SELECT_MUTATION
            ))
            .map_err(db_err)?;
        let rows: Vec<_> = stmt
            .query_map([], row_to_mutation)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().collect()
    }

    /// Queue counters by status.
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let guard = self.locked();
        let mut stmt = guard
            .conn
            .prepare("SELECT status, COUNT(*) FROM offline_queue GROUP BY status")
            .map_err(db_err)?;
        let mut stats = QueueStats::default();
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;
        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            let count = count as u64;
            match MutationStatus::parse(&status)? {
                MutationStatus::Pending => stats.pending = count,
                MutationStatus::Processing => stats.processing = count,
                MutationStatus::Completed => stats.completed = count,
                MutationStatus::Failed => stats.failed = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    /// Delete completed mutations enqueued before the cutoff.
    pub fn prune_completed_mutations(&self, before: DateTime<Utc>) -> Result<usize> {
        let guard = self.locked();
        let pruned = guard
            .conn
            .execute(
                "DELETE FROM offline_queue \
                 WHERE status = 'completed' AND enqueued_at < ?1",
                params![before.to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(pruned)
    }
}

const SELECT_MUTATION: &str = "SELECT id, operation, entity_type, record_id, payload, \
     base_write_date, enqueued_at, retry_count, max_retries, status, last_error \
     FROM offline_queue";

type SqliteResult<T> = std::result::Result<T, rusqlite::Error>;

fn row_to_mutation(row: &rusqlite::Row<'_>) -> SqliteResult<Result<QueuedMutation>> {
    let id: String = row.get(0)?;
    let operation: String = row.get(1)?;
    let entity_type: String = row.get(2)?;
    let record_id: Option<RecordId> = row.get(3)?;
    let payload: String = row.get(4)?;
    let base_write_date: Option<String> = row.get(5)?;
    let enqueued_at: String = row.get(6)?;
    let retry_count: u32 = row.get(7)?;
    let max_retries: u32 = row.get(8)?;
    let status: String = row.get(9)?;
    let last_error: Option<String> = row.get(10)?;

    Ok((|| {
        Ok(QueuedMutation {
            id,
            operation: MutationOp::parse(&operation)?,
            entity_type: EntityType::new(entity_type)?,
            record_id,
            payload: serde_json::from_str(&payload)
                .map_err(|e| Error::Corrupt(format!("undecodable queue payload: {}", e)))?,
            base_write_date: base_write_date
                .as_deref()
                .map(ServerTimestamp::parse)
                .transpose()?,
            enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
                .map_err(|e| Error::Corrupt(format!("bad enqueued_at: {}", e)))?
                .with_timezone(&Utc),
            retry_count,
            max_retries,
            status: MutationStatus::parse(&status)?,
            last_error,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact() -> EntityType {
        EntityType::new("res.partner").unwrap()
    }

    fn update_mutation(record_id: RecordId, name: &str) -> QueuedMutation {
        let mut payload = Record::new();
        payload.set("name", json!(name));
        QueuedMutation::new(
            MutationOp::Update,
            contact(),
            payload,
            Some(record_id),
            None,
            3,
        )
    }

    #[test]
    fn test_insert_and_load_roundtrip() {
        let store = LocalStore::in_memory().unwrap();
        let m = update_mutation(5, "X");
        store.insert_mutation(&m).unwrap();

        let loaded = store.get_mutation(&m.id).unwrap().unwrap();
        assert_eq!(loaded, m);
    }

    #[test]
    fn test_active_duplicate_detected() {
        let store = LocalStore::in_memory().unwrap();
        let m = update_mutation(5, "X");
        store.insert_mutation(&m).unwrap();

        let dup = store
            .find_active_duplicate(
                MutationOp::Update,
                &contact(),
                Some(5),
                &m.payload_text().unwrap(),
            )
            .unwrap();
        assert_eq!(dup, Some(m.id.clone()));

        // Different payload is not a duplicate.
        let other = update_mutation(5, "Y");
        let none = store
            .find_active_duplicate(
                MutationOp::Update,
                &contact(),
                Some(5),
                &other.payload_text().unwrap(),
            )
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_terminal_status_frees_dedup_slot() {
        let store = LocalStore::in_memory().unwrap();
        let mut m = update_mutation(5, "X");
        store.insert_mutation(&m).unwrap();

        m.status = MutationStatus::Completed;
        store.update_mutation(&m).unwrap();

        let dup = store
            .find_active_duplicate(
                MutationOp::Update,
                &contact(),
                Some(5),
                &m.payload_text().unwrap(),
            )
            .unwrap();
        assert!(dup.is_none());
    }

    #[test]
    fn test_pending_order_is_fifo() {
        let store = LocalStore::in_memory().unwrap();
        let mut first = update_mutation(1, "A");
        first.enqueued_at = Utc::now() - chrono::Duration::seconds(10);
        first.id = "first".to_string();
        let mut second = update_mutation(2, "B");
        second.id = "second".to_string();

        store.insert_mutation(&second).unwrap();
        store.insert_mutation(&first).unwrap();

        let pending = store.load_pending_mutations(None).unwrap();
        assert_eq!(pending[0].id, "first");
        assert_eq!(pending[1].id, "second");
    }

    #[test]
    fn test_reopen_requeues_in_flight_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let store = LocalStore::open(&path).unwrap();
        let mut m = update_mutation(7, "X");
        store.insert_mutation(&m).unwrap();
        m.status = MutationStatus::Processing;
        store.update_mutation(&m).unwrap();
        assert!(store.load_pending_mutations(None).unwrap().is_empty());
        drop(store);

        // A drain that dies mid-flight leaves the row 'processing';
        // reopening puts it back in line.
        let store = LocalStore::open(&path).unwrap();
        let pending = store.load_pending_mutations(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, m.id);
        assert_eq!(pending[0].status, MutationStatus::Pending);
    }

    #[test]
    fn test_stats_and_prune() {
        let store = LocalStore::in_memory().unwrap();
        let mut done = update_mutation(1, "A");
        done.id = "done".into();
        done.enqueued_at = Utc::now() - chrono::Duration::days(2);
        store.insert_mutation(&done).unwrap();
        done.status = MutationStatus::Completed;
        store.update_mutation(&done).unwrap();

        let live = update_mutation(2, "B");
        store.insert_mutation(&live).unwrap();

        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total, 2);

        let pruned = store
            .prune_completed_mutations(Utc::now() - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.queue_stats().unwrap().total, 1);
    }
}
