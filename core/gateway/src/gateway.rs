//! Remote gateway trait definition.

use async_trait::async_trait;
use std::time::Duration;

use erpsync_common::{EntityType, Record, RecordId, Result};

use crate::domain::Domain;

/// Options for search-style gateway calls.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum number of records to return.
    pub limit: Option<u32>,
    /// Offset into the result set (pagination).
    pub offset: u32,
    /// Sort order, e.g. "write_date desc".
    pub order: Option<String>,
    /// Per-call deadline. Tuned per entity type: larger for
    /// message/attachment-heavy types, smaller for master data.
    pub timeout: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: None,
            offset: 0,
            order: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl SearchOptions {
    /// Set the record limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the result offset.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Set the sort order.
    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    /// Set the call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Gateway to the remote ERP's generic record operations.
///
/// Implementations own authentication, transport, and session binding;
/// the sync engine only depends on this contract. Every method is a
/// suspension point and may fail with a retryable error
/// (`Network`/`Timeout`/`RateLimited`), a `PermissionDenied`, or a
/// `Schema` error for an invalid field.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Implementation name, for diagnostics.
    fn name(&self) -> &str;

    /// Find record ids matching a domain.
    async fn search(
        &self,
        entity_type: &EntityType,
        domain: &Domain,
        options: &SearchOptions,
    ) -> Result<Vec<RecordId>>;

    /// Find and read records matching a domain, projected to `fields`.
    ///
    /// The `id` field is always present in returned records.
    async fn search_read(
        &self,
        entity_type: &EntityType,
        domain: &Domain,
        fields: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<Record>>;

    /// Read specific records by id, projected to `fields`.
    ///
    /// Unknown ids are silently absent from the result.
    async fn read(
        &self,
        entity_type: &EntityType,
        ids: &[RecordId],
        fields: &[String],
    ) -> Result<Vec<Record>>;

    /// Create a record, returning its server-assigned id.
    async fn create(&self, entity_type: &EntityType, values: &Record) -> Result<RecordId>;

    /// Update fields on existing records.
    async fn write(
        &self,
        entity_type: &EntityType,
        ids: &[RecordId],
        values: &Record,
    ) -> Result<bool>;

    /// Delete records.
    async fn unlink(&self, entity_type: &EntityType, ids: &[RecordId]) -> Result<bool>;

    /// Count records matching a domain.
    async fn count(&self, entity_type: &EntityType, domain: &Domain) -> Result<u64>;
}
