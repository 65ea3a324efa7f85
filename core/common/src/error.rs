//! Common error types for the sync core.

use thiserror::Error;

/// Top-level error type for sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network-level failure (connection reset, DNS, unreachable host).
    #[error("Network error: {0}")]
    Network(String),

    /// Remote call exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Remote rejected the call due to rate limiting.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Caller lacks access to an entity type or operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A requested field does not exist or was rejected server-side.
    #[error("Schema error on field '{field}': {message}")]
    Schema { field: String, message: String },

    /// Local database operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An entity type's data cannot be decoded at all.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A coordinated sync run failed as a whole.
    #[error("Sync run failed: {0}")]
    SyncFailed(String),
}

impl Error {
    /// Whether the failure is transient and worth retrying.
    ///
    /// Permission, schema, and corruption errors are never retried;
    /// they require fallback handling or user attention instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::RateLimited(_) | Error::Io(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Timeout("search_read".into()).is_retryable());
        assert!(Error::RateLimited("slow down".into()).is_retryable());

        assert!(!Error::PermissionDenied("res.partner".into()).is_retryable());
        assert!(!Error::Schema {
            field: "x_custom".into(),
            message: "unknown".into()
        }
        .is_retryable());
        assert!(!Error::Corrupt("bad payload".into()).is_retryable());
        assert!(!Error::NotFound("record 42".into()).is_retryable());
    }
}
