//! Remote gateway abstraction for the sync core.
//!
//! The gateway exposes the remote ERP's generic record operations
//! (search, read, create, write, unlink, count) against named entity
//! collections. Authentication and transport are the caller's concern;
//! this crate defines the contract the sync engine consumes, plus an
//! in-memory implementation used by tests and the demo CLI.

pub mod domain;
pub mod gateway;
pub mod memory;

pub use domain::{CompareOp, Condition, Domain, DomainExpr};
pub use gateway::{RemoteGateway, SearchOptions};
pub use memory::{MemoryGateway, ScriptedFailure};
