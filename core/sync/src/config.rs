//! Sync configuration: global settings and per-entity-type policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use erpsync_common::EntityType;
use erpsync_gateway::Domain;

use crate::conflict::ConflictStrategy;

/// Fields stripped from every pull unless explicitly re-requested:
/// metadata-only, binary, or unstable computed fields that never
/// round-trip correctly and bloat storage.
pub const DEFAULT_EXCLUDED_FIELDS: &[&str] = &[
    "__last_update",
    "image_1920",
    "image_1024",
    "image_512",
    "image_256",
    "image_128",
    "avatar_1920",
    "avatar_128",
    "message_ids",
    "message_follower_ids",
    "activity_ids",
];

/// How the first (or forced-full) pull for a type is scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStrategy {
    /// Pull the complete remote set.
    All,
    /// Pull only records changed within the retention window.
    TimeWindow { days: u32 },
}

/// When local rows absent from a pull result may be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrunePolicy {
    /// Never delete based on pull results.
    Never,
    /// Delete rows missing from a full (non-incremental) pull result.
    /// Incremental results only contain changed rows and are never a
    /// complete snapshot, so they never trigger pruning.
    AfterFullPull,
}

/// Per-entity-type sync policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub entity_type: EntityType,
    pub enabled: bool,
    pub strategy: SyncStrategy,
    /// Lower runs earlier among independent types.
    pub priority: u32,
    /// Types that must sync before this one in the same run (e.g. the
    /// owning collection of a membership-scoped type).
    pub depends_on: Vec<EntityType>,
    /// Invariant filter ANDed onto every pull domain (e.g. "active
    /// only", "channels I am a member of").
    pub scope: Domain,
    /// Requested field projection; empty means all fields.
    pub fields: Vec<String>,
    /// Fields stripped from requests and stored records.
    pub excluded_fields: Vec<String>,
    /// Reduced safe field set used after a server-side schema error.
    pub fallback_fields: Vec<String>,
    /// Page size for pulls.
    pub batch_size: u32,
    /// Incremental change counts above this switch to paged pulls
    /// ordered by write_date desc.
    pub page_threshold: u64,
    /// Per-call deadline, tuned to expected payload size.
    pub timeout: Duration,
    pub prune: PrunePolicy,
}

impl EntityConfig {
    /// Defaults for a type: enabled, time-windowed to 90 days, no
    /// scope, standard exclusions, no pruning.
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            enabled: true,
            strategy: SyncStrategy::TimeWindow { days: 90 },
            priority: 100,
            depends_on: Vec::new(),
            scope: Domain::all(),
            fields: Vec::new(),
            excluded_fields: DEFAULT_EXCLUDED_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback_fields: vec![
                "id".to_string(),
                "name".to_string(),
                "write_date".to_string(),
            ],
            batch_size: 200,
            page_threshold: 500,
            timeout: Duration::from_secs(30),
            prune: PrunePolicy::Never,
        }
    }

    pub fn with_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<EntityType>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_scope(mut self, scope: Domain) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_fallback_fields(mut self, fields: Vec<String>) -> Self {
        self.fallback_fields = fields;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_page_threshold(mut self, threshold: u64) -> Self {
        self.page_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_prune(mut self, prune: PrunePolicy) -> Self {
        self.prune = prune;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Fields to request: the configured projection minus exclusions.
    pub fn effective_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| !self.excluded_fields.contains(f))
            .cloned()
            .collect()
    }
}

/// Global sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub entities: Vec<EntityConfig>,
    /// Remote-call retry attempts (exponential backoff).
    pub max_retries: u32,
    pub conflict_strategy: ConflictStrategy,
    /// Entity types synced concurrently within one dependency level.
    pub max_concurrent_types: usize,
    /// Pause between queue drain operations.
    pub drain_delay: Duration,
    /// Attempt cap per queued mutation before terminal failure.
    pub queue_max_retries: u32,
    /// Completed queue entries older than this are pruned.
    pub completed_retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            max_retries: 3,
            conflict_strategy: ConflictStrategy::RemoteWins,
            max_concurrent_types: 3,
            drain_delay: Duration::from_millis(150),
            queue_max_retries: 3,
            completed_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl SyncConfig {
    /// Register or replace an entity config.
    pub fn with_entity(mut self, entity: EntityConfig) -> Self {
        self.entities
            .retain(|e| e.entity_type != entity.entity_type);
        self.entities.push(entity);
        self
    }

    /// Config for a type, if registered.
    pub fn entity(&self, entity_type: &EntityType) -> Option<&EntityConfig> {
        self.entities.iter().find(|e| &e.entity_type == entity_type)
    }

    /// Config for a type, falling back to defaults.
    pub fn entity_or_default(&self, entity_type: &EntityType) -> EntityConfig {
        self.entity(entity_type)
            .cloned()
            .unwrap_or_else(|| EntityConfig::new(entity_type.clone()))
    }

    /// All enabled entity types in priority order.
    pub fn enabled_types(&self) -> Vec<EntityType> {
        let mut entities: Vec<&EntityConfig> =
            self.entities.iter().filter(|e| e.enabled).collect();
        entities.sort_by_key(|e| e.priority);
        entities.iter().map(|e| e.entity_type.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> EntityType {
        EntityType::new("res.partner").unwrap()
    }

    #[test]
    fn test_effective_fields_strips_exclusions() {
        let cfg = EntityConfig::new(contact()).with_fields(vec![
            "name".to_string(),
            "image_1920".to_string(),
            "write_date".to_string(),
        ]);
        let fields = cfg.effective_fields();
        assert_eq!(fields, vec!["name", "write_date"]);
    }

    #[test]
    fn test_entity_replacement() {
        let config = SyncConfig::default()
            .with_entity(EntityConfig::new(contact()).with_priority(5))
            .with_entity(EntityConfig::new(contact()).with_priority(9));
        assert_eq!(config.entities.len(), 1);
        assert_eq!(config.entity(&contact()).unwrap().priority, 9);
    }

    #[test]
    fn test_enabled_types_priority_order() {
        let channel = EntityType::new("discuss.channel").unwrap();
        let config = SyncConfig::default()
            .with_entity(EntityConfig::new(contact()).with_priority(10))
            .with_entity(EntityConfig::new(channel.clone()).with_priority(1))
            .with_entity(
                EntityConfig::new(EntityType::new("ir.attachment").unwrap()).disabled(),
            );
        assert_eq!(config.enabled_types(), vec![channel, contact()]);
    }
}
