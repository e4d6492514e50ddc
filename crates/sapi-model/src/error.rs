//! Model error types.

use std::fmt;

use sapi_core::Bucket;
use sapi_store::StoreError;
use thiserror::Error;

/// Which external (compute orchestration) step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    ProvisionFailed,
    DestroyFailed,
    ReprovisionFailed,
    TeardownHookFailed,
    /// A job did not finish within the polling bound.
    Timeout,
}

impl fmt::Display for ExternalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExternalKind::ProvisionFailed => "provision failed",
            ExternalKind::DestroyFailed => "destroy failed",
            ExternalKind::ReprovisionFailed => "reprovision failed",
            ExternalKind::TeardownHookFailed => "teardown hook failed",
            ExternalKind::Timeout => "job timed out",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the model to its callers.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{kind} not found: {uuid}")]
    NotFound { kind: &'static str, uuid: String },

    #[error("conflicting concurrent update: {0}")]
    Conflict(String),

    #[error("metadata does not match metadata_schema: {0}")]
    SchemaInvalid(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("compute orchestration is unavailable in proto mode")]
    ProtoMode,

    #[error("{kind}: {detail}")]
    External { kind: ExternalKind, detail: String },

    #[error("upgrade to full mode failed at {step}: {detail}")]
    Migration { step: &'static str, detail: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ModelError {
    pub fn not_found(bucket: Bucket, uuid: impl Into<String>) -> Self {
        ModelError::NotFound {
            kind: entity_name(bucket),
            uuid: uuid.into(),
        }
    }

    pub fn external(kind: ExternalKind, detail: impl fmt::Display) -> Self {
        ModelError::External {
            kind,
            detail: detail.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ModelError::NotFound { .. } => true,
            ModelError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Map a store-level NotFound into the entity-level one.
    pub(crate) fn from_store(bucket: Bucket, uuid: &str, err: StoreError) -> Self {
        if err.is_not_found() {
            ModelError::not_found(bucket, uuid)
        } else {
            ModelError::Store(err)
        }
    }
}

/// Human name of the entity a bucket holds.
pub fn entity_name(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::Applications => "application",
        Bucket::Services => "service",
        Bucket::Instances => "instance",
        Bucket::Manifests => "manifest",
        Bucket::History => "history entry",
    }
}

pub type ModelResult<T> = Result<T, ModelError>;
