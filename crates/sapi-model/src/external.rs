//! Interfaces to the systems the model drives but does not own.
//!
//! Compute orchestration, remote command execution, metadata schema
//! validation, the proto-mode marker and the full-mode backend factory are
//! all injected behind traits so the model can be exercised without a
//! datacenter.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sapi_core::Attributes;
use sapi_store::{ObjectStore, StoreResult};
use serde_json::Value;
use tracing::info;

/// Execution state of an asynchronous compute job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobExecution {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub uuid: String,
    pub execution: JobExecution,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vm {
    pub uuid: String,
    /// Compute node hosting the VM, once placed.
    pub server_uuid: Option<String>,
    pub state: String,
}

/// Request options forwarded with a VM creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateVmOptions {
    /// Correlates the orchestrator's job with the registry request.
    pub request_id: Option<String>,
}

/// Compute orchestration. Mutating calls return the uuid of the job
/// carrying out the request.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn create_vm(&self, params: &Attributes, opts: &CreateVmOptions) -> anyhow::Result<String>;

    /// `None` when no such VM exists.
    async fn get_vm(&self, uuid: &str) -> anyhow::Result<Option<Vm>>;

    async fn delete_vm(&self, uuid: &str) -> anyhow::Result<String>;

    async fn reprovision_vm(&self, uuid: &str, image_uuid: &str) -> anyhow::Result<String>;

    async fn get_job(&self, uuid: &str) -> anyhow::Result<Job>;
}

/// Runs a script on a compute node.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_command(&self, server_uuid: &str, script: &str) -> anyhow::Result<()>;
}

/// Checks a document against a JSON schema. The error lists the violations.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &Value, document: &Value) -> Result<(), String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaValidator;

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, schema: &Value, document: &Value) -> Result<(), String> {
        let compiled = jsonschema::JSONSchema::compile(schema)
            .map_err(|e| format!("metadata_schema is not a valid schema: {e}"))?;
        compiled.validate(document).map_err(|errors| {
            errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
    }
}

/// Persistent flag recording that the registry still runs in proto mode.
#[async_trait]
pub trait ProtoMarker: Send + Sync {
    async fn is_set(&self) -> bool;
    async fn set(&self) -> io::Result<()>;
    async fn clear(&self) -> io::Result<()>;
}

/// Marker backed by the presence of a file.
#[derive(Debug, Clone)]
pub struct FileProtoMarker {
    path: PathBuf,
}

impl FileProtoMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProtoMarker for FileProtoMarker {
    async fn is_set(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    async fn set(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, b"").await
    }

    async fn clear(&self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "proto mode marker removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Connects the dependencies that only exist in full mode.
#[async_trait]
pub trait FullModeBackends: Send + Sync {
    async fn connect_compute(&self) -> anyhow::Result<Arc<dyn ComputeApi>>;

    /// A Moray-backed store, not yet initialized.
    async fn connect_moray(&self) -> StoreResult<Arc<dyn ObjectStore>>;
}
