//! Conflict detection and resolution policy.
//!
//! A conflict exists when a queued local mutation's target record has
//! also changed remotely since the mutation was enqueued, observed as
//! the remote write_date advancing past the captured baseline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use erpsync_common::{EntityType, Record, RecordId, ServerTimestamp};

/// Resolution strategy for detected conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Keep the server-confirmed write; discard the local change after
    /// refreshing the local copy. The safe deterministic default: it
    /// never silently destroys a collaborator's confirmed write.
    RemoteWins,
    /// Push the local change over the remote record.
    LocalWins,
    /// Park the mutation for user resolution.
    Manual,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::RemoteWins
    }
}

/// A detected local/remote divergence. Not an error: conflicts are
/// first-class data routed through the resolution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub record_id: RecordId,
    /// The queued local change.
    pub local_payload: Record,
    /// The remote record as found at push time.
    pub remote_payload: Record,
    /// Baseline write_date captured when the mutation was enqueued.
    pub base_write_date: Option<ServerTimestamp>,
    /// Remote write_date observed at detection.
    pub remote_write_date: Option<ServerTimestamp>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn new(
        entity_type: EntityType,
        record_id: RecordId,
        local_payload: Record,
        remote_payload: Record,
        base_write_date: Option<ServerTimestamp>,
    ) -> Self {
        let remote_write_date = remote_payload.write_date();
        Self {
            id: Uuid::new_v4(),
            entity_type,
            record_id,
            local_payload,
            remote_payload,
            base_write_date,
            remote_write_date,
            detected_at: Utc::now(),
        }
    }
}

/// Applies the configured strategy to detected conflicts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Whether the remote record has advanced past the captured
    /// baseline. No baseline means no conflict can be proven; the push
    /// proceeds (first write to a record the device never saw synced).
    pub fn detect(
        &self,
        base: Option<ServerTimestamp>,
        remote: Option<ServerTimestamp>,
    ) -> bool {
        match (base, remote) {
            (Some(base), Some(remote)) => remote > base,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> ServerTimestamp {
        ServerTimestamp::parse(s).unwrap()
    }

    #[test]
    fn test_default_strategy_is_remote_wins() {
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::RemoteWins);
    }

    #[test]
    fn test_detect_remote_advanced() {
        let resolver = ConflictResolver::default();
        assert!(resolver.detect(
            Some(ts("2024-01-01 00:00:00")),
            Some(ts("2024-01-05 00:00:00"))
        ));
    }

    #[test]
    fn test_no_conflict_when_remote_unchanged() {
        let resolver = ConflictResolver::default();
        assert!(!resolver.detect(
            Some(ts("2024-01-01 00:00:00")),
            Some(ts("2024-01-01 00:00:00"))
        ));
        // Remote older than baseline is also not a conflict.
        assert!(!resolver.detect(
            Some(ts("2024-01-05 00:00:00")),
            Some(ts("2024-01-01 00:00:00"))
        ));
    }

    #[test]
    fn test_no_baseline_no_conflict() {
        let resolver = ConflictResolver::default();
        assert!(!resolver.detect(None, Some(ts("2024-01-05 00:00:00"))));
        assert!(!resolver.detect(Some(ts("2024-01-01 00:00:00")), None));
    }
}
