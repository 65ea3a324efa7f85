//! Durable offline mutation queue.
//!
//! Local writes made while offline (or that failed to push) are
//! persisted as [`QueuedMutation`] rows and replayed in FIFO order on
//! the next drain. SQLite is the authoritative store; an optional JSON
//! snapshot of the active entries is written after each drain as a
//! recovery aid.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use erpsync_common::{EntityType, Error, Record, RecordId, Result};
use erpsync_gateway::RemoteGateway;
use erpsync_store::{LocalStore, MutationOp, MutationStatus, QueueStats, QueuedMutation};

use crate::conflict::{ConflictRecord, ConflictResolver, ConflictStrategy};
use crate::connectivity::Connectivity;

/// Result of one drain pass.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Mutations taken off the queue this pass.
    pub processed: usize,
    /// Pushed successfully (or resolved by the remote copy winning).
    pub completed: usize,
    /// Put back to pending for a later attempt.
    pub requeued: usize,
    /// Terminally failed.
    pub failed: usize,
    /// Divergences detected while pushing.
    pub conflicts: Vec<ConflictRecord>,
}

/// Replays queued local mutations against the remote gateway.
pub struct MutationQueue<G: ?Sized> {
    store: Arc<LocalStore>,
    gateway: Arc<G>,
    connectivity: Connectivity,
    resolver: ConflictResolver,
    max_retries: u32,
    drain_delay: Duration,
    backup_path: Option<PathBuf>,
}

impl<G: RemoteGateway + ?Sized> MutationQueue<G> {
    pub fn new(
        store: Arc<LocalStore>,
        gateway: Arc<G>,
        connectivity: Connectivity,
        resolver: ConflictResolver,
    ) -> Self {
        Self {
            store,
            gateway,
            connectivity,
            resolver,
            max_retries: 3,
            drain_delay: Duration::from_millis(150),
            backup_path: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = delay;
        self
    }

    /// Write a JSON snapshot of active entries to this path after each
    /// drain.
    pub fn with_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    /// Enqueue a local mutation for later push.
    ///
    /// Returns the id of the queued entry. If an identical mutation
    /// (same operation, type, record id, and payload) is already
    /// pending or processing, its id is returned instead of inserting
    /// a second copy. For updates and deletes, the target record's
    /// locally stored `write_date` is captured as the conflict
    /// baseline.
    pub fn enqueue(
        &self,
        operation: MutationOp,
        entity_type: EntityType,
        record_id: Option<RecordId>,
        payload: Record,
    ) -> Result<String> {
        match operation {
            MutationOp::Create => {
                if record_id.is_some() {
                    return Err(Error::InvalidInput(
                        "create mutations must not carry a record id".into(),
                    ));
                }
            }
            MutationOp::Update | MutationOp::Delete => {
                if record_id.is_none() {
                    return Err(Error::InvalidInput(format!(
                        "{} mutations require a record id",
                        operation.as_str()
                    )));
                }
            }
        }

        let base_write_date = match record_id {
            Some(id) if operation != MutationOp::Create => self
                .store
                .get_record(&entity_type, id)?
                .and_then(|r| r.write_date()),
            _ => None,
        };

        let mutation = QueuedMutation::new(
            operation,
            entity_type,
            payload,
            record_id,
            base_write_date,
            self.max_retries,
        );
        let payload_text = mutation.payload_text()?;

        if let Some(existing) = self.store.find_active_duplicate(
            operation,
            &mutation.entity_type,
            record_id,
            &payload_text,
        )? {
            debug!(id = %existing, "identical mutation already queued");
            return Ok(existing);
        }

        match self.store.insert_mutation(&mutation) {
            Ok(()) => {}
            // The unique index backstops the check above; a constraint
            // hit means an identical row landed concurrently.
            Err(Error::Storage(msg)) if msg.contains("UNIQUE") => {
                if let Some(existing) = self.store.find_active_duplicate(
                    operation,
                    &mutation.entity_type,
                    record_id,
                    &payload_text,
                )? {
                    return Ok(existing);
                }
                return Err(Error::Storage(msg));
            }
            Err(e) => return Err(e),
        }

        info!(
            id = %mutation.id,
            op = operation.as_str(),
            entity = %mutation.entity_type,
            "mutation enqueued"
        );
        Ok(mutation.id)
    }

    /// Drain all pending mutations.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        self.drain_entity(None).await
    }

    /// Drain pending mutations, optionally restricted to one type.
    ///
    /// A no-op while offline. Stops early if connectivity drops
    /// mid-drain; remaining entries stay pending.
    pub async fn drain_entity(&self, entity_type: Option<&EntityType>) -> Result<DrainOutcome> {
        let mut outcome = DrainOutcome::default();
        if !self.connectivity.is_online() {
            debug!("offline, skipping queue drain");
            return Ok(outcome);
        }

        let pending = self.store.load_pending_mutations(entity_type)?;
        if pending.is_empty() {
            return Ok(outcome);
        }
        info!(count = pending.len(), "draining offline queue");

        let mut first = true;
        for mutation in pending {
            if !self.connectivity.is_online() {
                debug!("connectivity lost mid-drain, deferring remainder");
                break;
            }
            if !first {
                sleep(self.drain_delay).await;
            }
            first = false;

            outcome.processed += 1;
            match self.process_one(mutation).await? {
                ProcessResult::Completed => outcome.completed += 1,
                ProcessResult::CompletedWithConflict(c) => {
                    outcome.completed += 1;
                    outcome.conflicts.push(c);
                }
                ProcessResult::Requeued => outcome.requeued += 1,
                ProcessResult::Failed => outcome.failed += 1,
                ProcessResult::FailedWithConflict(c) => {
                    outcome.failed += 1;
                    outcome.conflicts.push(c);
                }
            }
        }

        self.write_backup();
        Ok(outcome)
    }

    async fn process_one(&self, mut mutation: QueuedMutation) -> Result<ProcessResult> {
        mutation.status = MutationStatus::Processing;
        self.store.update_mutation(&mutation)?;

        let mut conflict = None;
        if let Some(id) = mutation.record_id {
            if mutation.base_write_date.is_some() {
                match self.check_conflict(&mutation, id).await {
                    Ok(Some(c)) => match self.resolver.strategy() {
                        ConflictStrategy::RemoteWins => {
                            // The remote copy stands; adopt it locally
                            // and drop the queued change.
                            self.refresh_local(&mutation.entity_type, id).await?;
                            mutation.status = MutationStatus::Completed;
                            mutation.last_error =
                                Some("superseded by remote change".to_string());
                            self.store.update_mutation(&mutation)?;
                            return Ok(ProcessResult::CompletedWithConflict(c));
                        }
                        ConflictStrategy::LocalWins => {
                            conflict = Some(c);
                        }
                        ConflictStrategy::Manual => {
                            mutation.status = MutationStatus::Failed;
                            mutation.last_error = Some(format!(
                                "conflict: remote record changed at {}",
                                c.remote_write_date
                                    .map_or_else(|| "?".to_string(), |t| t.to_string())
                            ));
                            self.store.update_mutation(&mutation)?;
                            return Ok(ProcessResult::FailedWithConflict(c));
                        }
                    },
                    Ok(None) => {}
                    Err(e) => return self.handle_failure(mutation, e),
                }
            }
        }

        match self.execute(&mutation).await {
            Ok(()) => {
                mutation.status = MutationStatus::Completed;
                mutation.last_error = None;
                self.store.update_mutation(&mutation)?;
                debug!(id = %mutation.id, "mutation pushed");
                match conflict {
                    Some(c) => Ok(ProcessResult::CompletedWithConflict(c)),
                    None => Ok(ProcessResult::Completed),
                }
            }
            Err(e) => self.handle_failure(mutation, e),
        }
    }

    /// Read the remote write_date and compare against the baseline.
    async fn check_conflict(
        &self,
        mutation: &QueuedMutation,
        id: RecordId,
    ) -> Result<Option<ConflictRecord>> {
        let fields = vec!["write_date".to_string()];
        let remote = self
            .gateway
            .read(&mutation.entity_type, &[id], &fields)
            .await?;
        let remote = match remote.into_iter().next() {
            Some(r) => r,
            // Target gone remotely: a delete is already done, an
            // update has nothing left to conflict with.
            None => return Ok(None),
        };
        if self
            .resolver
            .detect(mutation.base_write_date, remote.write_date())
        {
            Ok(Some(ConflictRecord::new(
                mutation.entity_type.clone(),
                id,
                mutation.payload.clone(),
                remote,
                mutation.base_write_date,
            )))
        } else {
            Ok(None)
        }
    }

    async fn execute(&self, mutation: &QueuedMutation) -> Result<()> {
        match mutation.operation {
            MutationOp::Create => {
                let id = self
                    .gateway
                    .create(&mutation.entity_type, &mutation.payload)
                    .await?;
                self.refresh_local(&mutation.entity_type, id).await
            }
            MutationOp::Update => {
                let id = mutation.record_id.ok_or_else(|| {
                    Error::Corrupt(format!("update mutation {} lost its record id", mutation.id))
                })?;
                self.gateway
                    .write(&mutation.entity_type, &[id], &mutation.payload)
                    .await?;
                self.refresh_local(&mutation.entity_type, id).await
            }
            MutationOp::Delete => {
                let id = mutation.record_id.ok_or_else(|| {
                    Error::Corrupt(format!("delete mutation {} lost its record id", mutation.id))
                })?;
                match self.gateway.unlink(&mutation.entity_type, &[id]).await {
                    Ok(_) => {}
                    // Already gone remotely counts as done.
                    Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.store.delete_records(&mutation.entity_type, &[id])?;
                Ok(())
            }
        }
    }

    /// Pull the server-confirmed record (with its authoritative
    /// write_date) back into the local store.
    async fn refresh_local(&self, entity_type: &EntityType, id: RecordId) -> Result<()> {
        let records = self.gateway.read(entity_type, &[id], &[]).await?;
        if records.is_empty() {
            self.store.delete_records(entity_type, &[id])?;
        } else {
            self.store.upsert_records(entity_type, &records)?;
        }
        Ok(())
    }

    fn handle_failure(
        &self,
        mut mutation: QueuedMutation,
        err: Error,
    ) -> Result<ProcessResult> {
        mutation.last_error = Some(err.to_string());
        if err.is_retryable() {
            mutation.retry_count += 1;
            if mutation.can_retry() {
                mutation.status = MutationStatus::Pending;
                warn!(
                    id = %mutation.id,
                    attempt = mutation.retry_count,
                    "push failed, will retry: {}", err
                );
                self.store.update_mutation(&mutation)?;
                return Ok(ProcessResult::Requeued);
            }
            warn!(id = %mutation.id, "push failed, retries exhausted: {}", err);
        } else {
            warn!(id = %mutation.id, "push failed permanently: {}", err);
        }
        mutation.status = MutationStatus::Failed;
        self.store.update_mutation(&mutation)?;
        Ok(ProcessResult::Failed)
    }

    /// Put a terminally failed mutation back into the pending state
    /// with a fresh attempt budget.
    pub fn retry(&self, id: &str) -> Result<()> {
        let mut mutation = self
            .store
            .get_mutation(id)?
            .ok_or_else(|| Error::NotFound(format!("queued mutation {}", id)))?;
        if mutation.status != MutationStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "mutation {} is {}, only failed mutations can be retried",
                id,
                mutation.status.as_str()
            )));
        }
        mutation.status = MutationStatus::Pending;
        mutation.retry_count = 0;
        self.store.update_mutation(&mutation)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.store.queue_stats()
    }

    /// Drop completed entries older than the retention window.
    pub fn prune_completed(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| Error::InvalidInput(format!("retention out of range: {}", e)))?;
        self.store.prune_completed_mutations(cutoff)
    }

    fn write_backup(&self) {
        let Some(path) = &self.backup_path else {
            return;
        };
        let snapshot = match self.store.load_active_mutations() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("queue backup skipped, load failed: {}", e);
                return;
            }
        };
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!(path = %path.display(), "queue backup write failed: {}", e);
                }
            }
            Err(e) => warn!("queue backup serialization failed: {}", e),
        }
    }
}

enum ProcessResult {
    Completed,
    CompletedWithConflict(ConflictRecord),
    Requeued,
    Failed,
    FailedWithConflict(ConflictRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use erpsync_gateway::{MemoryGateway, ScriptedFailure};
    use serde_json::json;

    fn contact() -> EntityType {
        EntityType::new("res.partner").unwrap()
    }

    fn record(id: RecordId, name: &str) -> Record {
        let mut r = Record::new();
        r.set("id", json!(id));
        r.set("name", json!(name));
        r
    }

    fn queue_with(
        strategy: ConflictStrategy,
    ) -> (MutationQueue<MemoryGateway>, Arc<LocalStore>, Arc<MemoryGateway>) {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let gateway = Arc::new(MemoryGateway::new());
        let queue = MutationQueue::new(
            store.clone(),
            gateway.clone(),
            Connectivity::online(),
            ConflictResolver::new(strategy),
        )
        .with_drain_delay(Duration::from_millis(1));
        (queue, store, gateway)
    }

    #[tokio::test]
    async fn test_create_pushed_and_mirrored_locally() {
        let (queue, store, gateway) = queue_with(ConflictStrategy::RemoteWins);
        let mut payload = Record::new();
        payload.set("name", json!("New Partner"));

        queue
            .enqueue(MutationOp::Create, contact(), None, payload)
            .unwrap();
        let outcome = queue.drain().await.unwrap();

        assert_eq!(outcome.completed, 1);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(gateway.call_count("create"), 1);
        // The server-confirmed record (with id and write_date) landed
        // in the local store.
        let records = store.list_records(&contact()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].write_date().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_collapses() {
        let (queue, store, _gateway) = queue_with(ConflictStrategy::RemoteWins);
        let mut payload = Record::new();
        payload.set("name", json!("X"));

        let first = queue
            .enqueue(MutationOp::Update, contact(), Some(7), payload.clone())
            .unwrap();
        let second = queue
            .enqueue(MutationOp::Update, contact(), Some(7), payload)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.queue_stats().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_distinct_payloads_both_queued() {
        let (queue, store, _gateway) = queue_with(ConflictStrategy::RemoteWins);
        let mut a = Record::new();
        a.set("name", json!("A"));
        let mut b = Record::new();
        b.set("name", json!("B"));

        queue.enqueue(MutationOp::Update, contact(), Some(7), a).unwrap();
        queue.enqueue(MutationOp::Update, contact(), Some(7), b).unwrap();

        assert_eq!(store.queue_stats().unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_offline_drain_is_noop() {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let gateway = Arc::new(MemoryGateway::new());
        let queue = MutationQueue::new(
            store.clone(),
            gateway.clone(),
            Connectivity::offline(),
            ConflictResolver::default(),
        );
        let mut payload = Record::new();
        payload.set("name", json!("X"));
        queue
            .enqueue(MutationOp::Create, contact(), None, payload)
            .unwrap();

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.processed, 0);
        assert_eq!(gateway.call_count("create"), 0);
        assert_eq!(store.queue_stats().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_restart_recovers_in_flight_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        let gateway = Arc::new(MemoryGateway::new());
        gateway.seed(&contact(), vec![{
            let mut r = Record::new();
            r.set("name", json!("Original"));
            r
        }]);

        let store = Arc::new(LocalStore::open(&path).unwrap());
        let queue = MutationQueue::new(
            store.clone(),
            gateway.clone(),
            Connectivity::online(),
            ConflictResolver::default(),
        )
        .with_drain_delay(Duration::from_millis(1));
        let mut payload = Record::new();
        payload.set("name", json!("Edited"));
        let id = queue
            .enqueue(MutationOp::Update, contact(), Some(1), payload.clone())
            .unwrap();

        // Simulate a process death mid-drain: the row is left in
        // 'processing' and never transitions.
        let mut stuck = store.get_mutation(&id).unwrap().unwrap();
        stuck.status = MutationStatus::Processing;
        store.update_mutation(&stuck).unwrap();
        drop(queue);
        drop(store);

        let store = Arc::new(LocalStore::open(&path).unwrap());
        let queue = MutationQueue::new(
            store.clone(),
            gateway.clone(),
            Connectivity::online(),
            ConflictResolver::default(),
        )
        .with_drain_delay(Duration::from_millis(1));

        // Re-submitting the same edit still deduplicates onto the
        // recovered row rather than inserting a second copy.
        let requeued = queue
            .enqueue(MutationOp::Update, contact(), Some(1), payload)
            .unwrap();
        assert_eq!(requeued, id);

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.completed, 1);
        assert_eq!(gateway.call_count("write"), 1);
        assert_eq!(store.queue_stats().unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_then_succeeds() {
        let (queue, store, gateway) = queue_with(ConflictStrategy::RemoteWins);
        gateway.fail_next(ScriptedFailure::Network);
        let mut payload = Record::new();
        payload.set("name", json!("X"));
        queue
            .enqueue(MutationOp::Create, contact(), None, payload)
            .unwrap();

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.requeued, 1);
        assert_eq!(store.queue_stats().unwrap().pending, 1);

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert_eq!(store.queue_stats().unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_terminal() {
        let (queue, store, gateway) = queue_with(ConflictStrategy::RemoteWins);
        let mut payload = Record::new();
        payload.set("name", json!("X"));
        queue
            .enqueue(MutationOp::Create, contact(), None, payload)
            .unwrap();

        gateway.fail_times(3, ScriptedFailure::Timeout);
        for _ in 0..3 {
            queue.drain().await.unwrap();
        }

        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);

        // Explicit retry resets the attempt budget.
        let all = store.load_all_mutations().unwrap();
        queue.retry(&all[0].id).unwrap();
        assert_eq!(store.queue_stats().unwrap().pending, 1);
        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.completed, 1);
    }

    #[tokio::test]
    async fn test_remote_wins_conflict_discards_local_change() {
        let (queue, store, gateway) = queue_with(ConflictStrategy::RemoteWins);
        gateway.seed(&contact(), vec![record(42, "Original")]);
        // Local store has the record as of an earlier sync.
        let seeded = gateway.get_record(&contact(), 42).unwrap();
        store.upsert_records(&contact(), &[seeded]).unwrap();

        let mut payload = Record::new();
        payload.set("name", json!("Local Edit"));
        queue
            .enqueue(MutationOp::Update, contact(), Some(42), payload)
            .unwrap();

        // Someone else edits the record before we push.
        let mut remote_edit = Record::new();
        remote_edit.set("name", json!("Remote Edit"));
        gateway.server_update(&contact(), 42, remote_edit);

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].record_id, 42);
        // The local edit was never pushed.
        assert_eq!(gateway.call_count("write"), 0);
        // Local copy now mirrors the remote winner.
        let local = store.get_record(&contact(), 42).unwrap().unwrap();
        assert_eq!(local.get("name"), Some(&json!("Remote Edit")));
    }

    #[tokio::test]
    async fn test_local_wins_conflict_pushes_anyway() {
        let (queue, store, gateway) = queue_with(ConflictStrategy::LocalWins);
        gateway.seed(&contact(), vec![record(42, "Original")]);
        let seeded = gateway.get_record(&contact(), 42).unwrap();
        store.upsert_records(&contact(), &[seeded]).unwrap();

        let mut payload = Record::new();
        payload.set("name", json!("Local Edit"));
        queue
            .enqueue(MutationOp::Update, contact(), Some(42), payload)
            .unwrap();

        let mut remote_edit = Record::new();
        remote_edit.set("name", json!("Remote Edit"));
        gateway.server_update(&contact(), 42, remote_edit);

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(gateway.call_count("write"), 1);
        assert_eq!(
            gateway.get_record(&contact(), 42).unwrap().get("name"),
            Some(&json!("Local Edit"))
        );
    }

    #[tokio::test]
    async fn test_manual_conflict_parks_mutation() {
        let (queue, store, gateway) = queue_with(ConflictStrategy::Manual);
        gateway.seed(&contact(), vec![record(42, "Original")]);
        let seeded = gateway.get_record(&contact(), 42).unwrap();
        store.upsert_records(&contact(), &[seeded]).unwrap();

        let mut payload = Record::new();
        payload.set("name", json!("Local Edit"));
        queue
            .enqueue(MutationOp::Update, contact(), Some(42), payload)
            .unwrap();

        let mut remote_edit = Record::new();
        remote_edit.set("name", json!("Remote Edit"));
        gateway.server_update(&contact(), 42, remote_edit);

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(gateway.call_count("write"), 0);

        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.failed, 1);
        let all = store.load_all_mutations().unwrap();
        assert!(all[0].last_error.as_deref().unwrap().contains("conflict"));
    }

    #[tokio::test]
    async fn test_no_conflict_when_remote_unchanged() {
        let (queue, store, gateway) = queue_with(ConflictStrategy::RemoteWins);
        gateway.seed(&contact(), vec![record(42, "Original")]);
        let seeded = gateway.get_record(&contact(), 42).unwrap();
        store.upsert_records(&contact(), &[seeded]).unwrap();

        let mut payload = Record::new();
        payload.set("name", json!("Local Edit"));
        queue
            .enqueue(MutationOp::Update, contact(), Some(42), payload)
            .unwrap();

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(gateway.call_count("write"), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_local_copy() {
        let (queue, store, gateway) = queue_with(ConflictStrategy::RemoteWins);
        gateway.seed(&contact(), vec![record(9, "Doomed")]);
        let seeded = gateway.get_record(&contact(), 9).unwrap();
        store.upsert_records(&contact(), &[seeded]).unwrap();

        queue
            .enqueue(MutationOp::Delete, contact(), Some(9), Record::new())
            .unwrap();
        let outcome = queue.drain().await.unwrap();

        assert_eq!(outcome.completed, 1);
        assert!(gateway.get_record(&contact(), 9).is_none());
        assert!(store.get_record(&contact(), 9).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_order_is_fifo() {
        let (queue, _store, gateway) = queue_with(ConflictStrategy::RemoteWins);
        for name in ["first", "second", "third"] {
            let mut payload = Record::new();
            payload.set("name", json!(name));
            queue
                .enqueue(MutationOp::Create, contact(), None, payload)
                .unwrap();
        }

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome.completed, 3);
        // Server ids are assigned in push order.
        assert_eq!(
            gateway.get_record(&contact(), 1).unwrap().get("name"),
            Some(&json!("first"))
        );
        assert_eq!(
            gateway.get_record(&contact(), 3).unwrap().get("name"),
            Some(&json!("third"))
        );
    }

    #[tokio::test]
    async fn test_backup_snapshot_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue-backup.json");
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let gateway = Arc::new(MemoryGateway::new());
        let queue = MutationQueue::new(
            store,
            gateway.clone(),
            Connectivity::online(),
            ConflictResolver::default(),
        )
        .with_backup_path(&path);

        gateway.fail_times(10, ScriptedFailure::Network);
        let mut payload = Record::new();
        payload.set("name", json!("X"));
        queue
            .enqueue(MutationOp::Create, contact(), None, payload)
            .unwrap();
        queue.drain().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<QueuedMutation> = serde_json::from_str(&text).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, MutationStatus::Pending);
    }

    #[test]
    fn test_enqueue_validates_record_id() {
        let (queue, _store, _gateway) = queue_with(ConflictStrategy::RemoteWins);
        let err = queue
            .enqueue(MutationOp::Update, contact(), None, Record::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
