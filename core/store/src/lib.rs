//! Embedded local store for the sync core.
//!
//! One SQLite table per synced entity type, created lazily from the
//! fields observed at runtime, plus a `sync_metadata` checkpoint table
//! and the durable `offline_queue` table. The store is the single
//! shared mutable resource of the sync core; all access goes through
//! one connection behind a lock.

pub mod checkpoint;
pub mod queue_table;
pub mod schema;
pub mod store;

pub use checkpoint::Checkpoint;
pub use queue_table::{MutationOp, MutationStatus, QueueStats, QueuedMutation};
pub use schema::SchemaAdapter;
pub use store::LocalStore;
