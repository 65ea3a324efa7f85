//! Common types shared across the sync core.
//!
//! This module provides the foundational record, identifier, and error
//! types used by the gateway, store, and sync engine crates.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{EntityType, Record, RecordId, ServerTimestamp};
