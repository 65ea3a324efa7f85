//! Per-entity-type sync checkpoints.

use serde::{Deserialize, Serialize};

use erpsync_common::{EntityType, ServerTimestamp};

/// Persisted high-water-mark of the last observed change for one
/// entity type, plus diagnostics that survive failed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub entity_type: EntityType,
    /// Client wall clock at the last pull attempt (success or failure).
    pub last_sync_timestamp: Option<ServerTimestamp>,
    /// Max `write_date` observed across all successful pulls. Only ever
    /// advances; never regresses, even across retries.
    pub last_sync_write_date: Option<ServerTimestamp>,
    /// Local row count after the last successful pull.
    pub total_records: u64,
    /// Disabled types are skipped until user reconfiguration
    /// (set false on permission denial).
    pub enabled: bool,
    /// Error from the last attempt, cleared on success.
    pub last_error: Option<String>,
    /// Number of sync attempts recorded for this type.
    pub sync_count: u64,
}

impl Checkpoint {
    /// Fresh checkpoint for a type that has never synced.
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            last_sync_timestamp: None,
            last_sync_write_date: None,
            total_records: 0,
            enabled: true,
            last_error: None,
            sync_count: 0,
        }
    }

    /// Advance the write_date high-water-mark. Regressions are ignored.
    pub fn advance_write_date(&mut self, observed: ServerTimestamp) {
        match self.last_sync_write_date {
            Some(current) if current >= observed => {}
            _ => self.last_sync_write_date = Some(observed),
        }
    }

    /// Record a successful pull attempt.
    pub fn record_success(&mut self, total_records: u64) {
        self.last_sync_timestamp = Some(ServerTimestamp::now());
        self.total_records = total_records;
        self.last_error = None;
        self.sync_count += 1;
    }

    /// Record a failed pull attempt. The write_date mark is untouched so
    /// the next retry has a stable baseline.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_sync_timestamp = Some(ServerTimestamp::now());
        self.last_error = Some(error.into());
        self.sync_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> EntityType {
        EntityType::new("res.partner").unwrap()
    }

    fn ts(s: &str) -> ServerTimestamp {
        ServerTimestamp::parse(s).unwrap()
    }

    #[test]
    fn test_write_date_only_advances() {
        let mut cp = Checkpoint::new(contact());

        cp.advance_write_date(ts("2024-01-02 00:00:00"));
        assert_eq!(cp.last_sync_write_date, Some(ts("2024-01-02 00:00:00")));

        // Older observation does not regress the mark.
        cp.advance_write_date(ts("2024-01-01 00:00:00"));
        assert_eq!(cp.last_sync_write_date, Some(ts("2024-01-02 00:00:00")));

        cp.advance_write_date(ts("2024-01-03 00:00:00"));
        assert_eq!(cp.last_sync_write_date, Some(ts("2024-01-03 00:00:00")));
    }

    #[test]
    fn test_failure_preserves_mark_and_records_error() {
        let mut cp = Checkpoint::new(contact());
        cp.advance_write_date(ts("2024-01-02 00:00:00"));
        cp.record_success(10);
        assert!(cp.last_error.is_none());

        cp.record_failure("timeout");
        assert_eq!(cp.last_error.as_deref(), Some("timeout"));
        assert_eq!(cp.last_sync_write_date, Some(ts("2024-01-02 00:00:00")));
        assert_eq!(cp.sync_count, 2);
    }
}
