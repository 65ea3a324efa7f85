//! Offline-first sync core.
//!
//! This module drives bidirectional reconciliation between the local
//! store and the remote gateway:
//! - Incremental pull with per-type checkpoints and strict write_date
//!   filtering
//! - A durable, deduplicated offline mutation queue with retry
//! - Conflict detection against advanced remote write_dates
//! - A coordinator serializing concurrent sync triggers into one run
//! - Retry strategy with capped exponential backoff

pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod queue;
pub mod retry;
pub mod trigger;

pub use config::{EntityConfig, PrunePolicy, SyncConfig, SyncStrategy};
pub use conflict::{ConflictRecord, ConflictResolver, ConflictStrategy};
pub use connectivity::Connectivity;
pub use coordinator::{
    CoordinatorConfig, CoordinatorHandle, CoordinatorState, CoordinatorStatus, SyncCoordinator,
};
pub use engine::{EntitySyncResult, SyncEngine, SyncReport};
pub use queue::{DrainOutcome, MutationQueue};
pub use retry::{RetryConfig, RetryExecutor};
pub use trigger::{TriggerPolicy, TriggerSource};
