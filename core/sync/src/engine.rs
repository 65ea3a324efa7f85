//! The sync engine: incremental pull, checkpointing, and queue push.
//!
//! Each entity type syncs independently against its own checkpoint.
//! The pull domain is strict (`write_date >` the checkpointed mark),
//! so a record whose write_date equals the checkpoint is never pulled
//! twice and a record changed during the pull is caught by the next
//! one. One type failing never aborts the others.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

use erpsync_common::{EntityType, Error, Record, Result, ServerTimestamp};
use erpsync_gateway::{CompareOp, Domain, RemoteGateway, SearchOptions};
use erpsync_store::{Checkpoint, LocalStore};

use crate::config::{EntityConfig, PrunePolicy, SyncConfig, SyncStrategy};
use crate::conflict::{ConflictRecord, ConflictResolver};
use crate::connectivity::Connectivity;
use crate::queue::MutationQueue;
use crate::retry::{RetryConfig, RetryExecutor};

/// Outcome of syncing a single entity type.
#[derive(Debug, Clone)]
pub struct EntitySyncResult {
    pub entity_type: EntityType,
    pub pulled: usize,
    pub pushed: usize,
    pub pruned: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub errors: Vec<String>,
    pub skipped: bool,
    pub duration: Duration,
}

impl EntitySyncResult {
    fn for_type(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            pulled: 0,
            pushed: 0,
            pruned: 0,
            conflicts: Vec::new(),
            errors: Vec::new(),
            skipped: false,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Aggregate outcome of one sync run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub results: Vec<EntitySyncResult>,
}

impl SyncReport {
    pub fn total_pulled(&self) -> usize {
        self.results.iter().map(|r| r.pulled).sum()
    }

    pub fn total_pushed(&self) -> usize {
        self.results.iter().map(|r| r.pushed).sum()
    }

    pub fn total_conflicts(&self) -> usize {
        self.results.iter().map(|r| r.conflicts.len()).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| !r.errors.is_empty())
    }

    pub fn errors(&self) -> Vec<&str> {
        self.results
            .iter()
            .flat_map(|r| r.errors.iter().map(String::as_str))
            .collect()
    }
}

/// Bidirectional sync driver for one store/gateway pair.
pub struct SyncEngine<G: ?Sized> {
    gateway: Arc<G>,
    store: Arc<LocalStore>,
    queue: MutationQueue<G>,
    connectivity: Connectivity,
    config: SyncConfig,
    retry: RetryExecutor,
    /// Types whose remote data proved undecodable this session; skipped
    /// until restart so one poisoned type cannot wedge every run.
    denylist: Mutex<HashSet<EntityType>>,
}

impl<G: RemoteGateway + ?Sized> SyncEngine<G> {
    pub fn new(
        gateway: Arc<G>,
        store: Arc<LocalStore>,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Self {
        let queue = MutationQueue::new(
            store.clone(),
            gateway.clone(),
            connectivity.clone(),
            ConflictResolver::new(config.conflict_strategy),
        )
        .with_max_retries(config.queue_max_retries)
        .with_drain_delay(config.drain_delay);
        let retry = RetryExecutor::new(
            RetryConfig::new(config.max_retries).with_initial_delay(Duration::from_millis(500)),
        );
        Self {
            gateway,
            store,
            queue,
            connectivity,
            config,
            retry,
            denylist: Mutex::new(HashSet::new()),
        }
    }

    /// The offline mutation queue backing this engine's push phase.
    pub fn queue(&self) -> &MutationQueue<G> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Sync every enabled entity type.
    pub async fn sync_all(&self, force_full: bool) -> Result<SyncReport> {
        self.sync_types(&self.config.enabled_types(), force_full).await
    }

    /// Sync the given types (dependencies are pulled in implicitly),
    /// grouped into dependency levels; types within a level run
    /// concurrently up to `max_concurrent_types`.
    pub async fn sync_types(
        &self,
        entity_types: &[EntityType],
        force_full: bool,
    ) -> Result<SyncReport> {
        if !self.connectivity.is_online() {
            return Err(Error::Network("device is offline".to_string()));
        }
        let started_at = Utc::now();
        let start = Instant::now();
        let levels = self.dependency_levels(entity_types)?;

        let mut results = Vec::new();
        for level in levels {
            let mut level_results: Vec<EntitySyncResult> = stream::iter(level)
                .map(|entity_type| self.sync_entity_type(entity_type, force_full))
                .buffer_unordered(self.config.max_concurrent_types.max(1))
                .collect()
                .await;
            results.append(&mut level_results);
        }

        let report = SyncReport {
            started_at,
            duration: start.elapsed(),
            results,
        };
        info!(
            pulled = report.total_pulled(),
            pushed = report.total_pushed(),
            conflicts = report.total_conflicts(),
            errors = report.errors().len(),
            "sync run finished"
        );
        // Housekeeping after a run; failure here never fails the sync.
        if let Err(e) = self.queue.prune_completed(self.config.completed_retention) {
            warn!("queue pruning failed: {}", e);
        }
        Ok(report)
    }

    /// Sync one entity type: pull remote changes, then drain this
    /// type's queued mutations. All failures are captured in the
    /// result rather than returned.
    pub async fn sync_entity_type(
        &self,
        entity_type: EntityType,
        force_full: bool,
    ) -> EntitySyncResult {
        let start = Instant::now();
        let mut result = EntitySyncResult::for_type(entity_type.clone());

        let entity_config = self.config.entity_or_default(&entity_type);
        if self.is_skipped(&entity_type, &entity_config, &mut result) {
            result.skipped = true;
            result.duration = start.elapsed();
            return result;
        }

        let mut checkpoint = match self.store.get_checkpoint(&entity_type) {
            Ok(cp) => cp.unwrap_or_else(|| Checkpoint::new(entity_type.clone())),
            Err(e) => {
                result.errors.push(format!("checkpoint load: {}", e));
                result.duration = start.elapsed();
                return result;
            }
        };

        let incremental = checkpoint.last_sync_write_date.is_some() && !force_full;
        match self
            .pull(&entity_type, &entity_config, &checkpoint, incremental)
            .await
        {
            Ok(records) => {
                result.pulled = records.len();
                if let Err(e) = self.apply_pull(
                    &entity_type,
                    &entity_config,
                    records,
                    incremental,
                    &mut checkpoint,
                    &mut result,
                ) {
                    result.errors.push(format!("apply pull: {}", e));
                    checkpoint.record_failure(e.to_string());
                }
            }
            Err(e) => {
                warn!(entity = %entity_type, "pull failed: {}", e);
                result.errors.push(format!("pull: {}", e));
                checkpoint.record_failure(e.to_string());
                match &e {
                    Error::PermissionDenied(_) => {
                        // Stop retrying a type the session cannot read.
                        checkpoint.enabled = false;
                        info!(entity = %entity_type, "disabled after permission denial");
                    }
                    Error::Corrupt(_) => {
                        if let Ok(mut denylist) = self.denylist.lock() {
                            denylist.insert(entity_type.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        // last_sync_write_date only ever moves forward; a failed pull
        // still records the attempt.
        if let Err(e) = self.store.save_checkpoint(&checkpoint) {
            result.errors.push(format!("checkpoint save: {}", e));
        }

        match self.queue.drain_entity(Some(&entity_type)).await {
            Ok(outcome) => {
                result.pushed = outcome.completed;
                result.conflicts.extend(outcome.conflicts);
                if outcome.failed > 0 {
                    result
                        .errors
                        .push(format!("{} queued mutations failed", outcome.failed));
                }
            }
            Err(e) => result.errors.push(format!("queue drain: {}", e)),
        }

        result.duration = start.elapsed();
        debug!(
            entity = %entity_type,
            pulled = result.pulled,
            pushed = result.pushed,
            "entity sync finished"
        );
        result
    }

    fn is_skipped(
        &self,
        entity_type: &EntityType,
        entity_config: &EntityConfig,
        result: &mut EntitySyncResult,
    ) -> bool {
        if !entity_config.enabled {
            return true;
        }
        if let Ok(denylist) = self.denylist.lock() {
            if denylist.contains(entity_type) {
                result
                    .errors
                    .push("skipped: previous pull returned undecodable data".to_string());
                return true;
            }
        }
        // A checkpoint-level disable (set after a permission denial)
        // outlives the config.
        match self.store.get_checkpoint(entity_type) {
            Ok(Some(cp)) if !cp.enabled => true,
            _ => false,
        }
    }

    /// Build the pull domain: strict write_date filter over the
    /// checkpoint when incremental, otherwise the configured strategy
    /// window; the scope domain is ANDed onto either.
    fn pull_domain(
        &self,
        entity_config: &EntityConfig,
        checkpoint: &Checkpoint,
        incremental: bool,
    ) -> Domain {
        let base = if incremental {
            // Unwrap-free: incremental is only true when the mark exists.
            match checkpoint.last_sync_write_date {
                Some(mark) => {
                    Domain::filter("write_date", CompareOp::Gt, json!(mark.to_string()))
                }
                None => Domain::all(),
            }
        } else {
            match entity_config.strategy {
                SyncStrategy::All => Domain::all(),
                SyncStrategy::TimeWindow { days } => Domain::filter(
                    "write_date",
                    CompareOp::Ge,
                    json!(ServerTimestamp::days_ago(days).to_string()),
                ),
            }
        };
        base.merge(entity_config.scope.clone())
    }

    async fn pull(
        &self,
        entity_type: &EntityType,
        entity_config: &EntityConfig,
        checkpoint: &Checkpoint,
        incremental: bool,
    ) -> Result<Vec<Record>> {
        let domain = self.pull_domain(entity_config, checkpoint, incremental);
        let fields = entity_config.effective_fields();
        match self
            .pull_with_fields(entity_type, entity_config, &domain, &fields)
            .await
        {
            Ok(records) => Ok(records),
            Err(Error::Schema { field, message }) => {
                // The remote model disagrees with our projection; drop
                // to the minimal field set rather than failing the type.
                warn!(
                    entity = %entity_type,
                    field, "schema mismatch ({}), retrying with fallback fields", message
                );
                self.pull_with_fields(
                    entity_type,
                    entity_config,
                    &domain,
                    &entity_config.fallback_fields,
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    async fn pull_with_fields(
        &self,
        entity_type: &EntityType,
        entity_config: &EntityConfig,
        domain: &Domain,
        fields: &[String],
    ) -> Result<Vec<Record>> {
        let total = self
            .retry
            .execute(|| async { self.gateway.count(entity_type, domain).await })
            .await?;

        if total <= entity_config.page_threshold {
            let options = SearchOptions::default()
                .with_order("write_date desc")
                .with_timeout(entity_config.timeout);
            return self
                .retry
                .execute(|| async {
                    self.gateway
                        .search_read(entity_type, domain, fields, &options)
                        .await
                })
                .await;
        }

        // Large change sets page through in write_date-descending
        // order so the newest data lands first.
        debug!(entity = %entity_type, total, "paged pull");
        let mut records = Vec::with_capacity(total as usize);
        let mut offset = 0u32;
        loop {
            let options = SearchOptions::default()
                .with_order("write_date desc")
                .with_timeout(entity_config.timeout)
                .with_limit(entity_config.batch_size)
                .with_offset(offset);
            let page = self
                .retry
                .execute(|| async {
                    self.gateway
                        .search_read(entity_type, domain, fields, &options)
                        .await
                })
                .await?;
            let fetched = page.len();
            records.extend(page);
            if fetched < entity_config.batch_size as usize
                || records.len() as u64 >= total
            {
                break;
            }
            offset += entity_config.batch_size;
        }
        Ok(records)
    }

    fn apply_pull(
        &self,
        entity_type: &EntityType,
        entity_config: &EntityConfig,
        mut records: Vec<Record>,
        incremental: bool,
        checkpoint: &mut Checkpoint,
        result: &mut EntitySyncResult,
    ) -> Result<()> {
        for record in &mut records {
            for field in &entity_config.excluded_fields {
                record.remove(field);
            }
        }

        self.store.upsert_records(entity_type, &records)?;

        if let Some(max) = records.iter().filter_map(Record::write_date).max() {
            checkpoint.advance_write_date(max);
        }

        // Only an unfiltered pull is a complete remote snapshot;
        // incremental and time-windowed results must never prune.
        if !incremental
            && entity_config.strategy == SyncStrategy::All
            && entity_config.prune == PrunePolicy::AfterFullPull
        {
            let keep: HashSet<_> = records.iter().filter_map(Record::id).collect();
            result.pruned = self.store.retain_only(entity_type, &keep)?;
            if result.pruned > 0 {
                info!(entity = %entity_type, pruned = result.pruned, "pruned stale rows");
            }
        }

        checkpoint.record_success(self.store.count_records(entity_type)?);
        Ok(())
    }

    /// Group the requested types (plus their transitive dependencies)
    /// into levels where everything a type depends on sits in an
    /// earlier level.
    fn dependency_levels(&self, requested: &[EntityType]) -> Result<Vec<Vec<EntityType>>> {
        let mut included: Vec<EntityType> = Vec::new();
        let mut pending: VecDeque<EntityType> = requested.iter().cloned().collect();
        while let Some(entity_type) = pending.pop_front() {
            if included.contains(&entity_type) {
                continue;
            }
            for dep in &self.config.entity_or_default(&entity_type).depends_on {
                pending.push_back(dep.clone());
            }
            included.push(entity_type);
        }

        let deps: HashMap<EntityType, Vec<EntityType>> = included
            .iter()
            .map(|t| (t.clone(), self.config.entity_or_default(t).depends_on))
            .collect();

        let mut placed: HashSet<EntityType> = HashSet::new();
        let mut levels: Vec<Vec<EntityType>> = Vec::new();
        let mut remaining = included;
        while !remaining.is_empty() {
            let (ready, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|t| {
                deps[t]
                    .iter()
                    .all(|d| placed.contains(d) || !deps.contains_key(d))
            });
            if ready.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "dependency cycle among entity types: {}",
                    rest.iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            placed.extend(ready.iter().cloned());
            levels.push(ready);
            remaining = rest;
        }
        Ok(levels)
    }
}
