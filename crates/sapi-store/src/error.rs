//! Error types for SAPI object stores.

use thiserror::Error;

/// Result type alias for object store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("etag conflict on {bucket}/{key}: expected {expected}, found {found}")]
    EtagConflict {
        bucket: String,
        key: String,
        expected: String,
        found: String,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("corrupt object {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// The backend answered, but the request itself was wrong.
    ///
    /// Usage errors are never masked by a fallback to another store; anything
    /// else is treated as the backend being unreachable.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. }
                | StoreError::BucketNotFound(_)
                | StoreError::EtagConflict { .. }
                | StoreError::InvalidQuery(_)
                | StoreError::Corrupt(_)
                | StoreError::Serialize(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::EtagConflict { .. })
    }
}
