//! sapi-model: the SAPI registry model.
//!
//! Owns the application → service → instance hierarchy and everything that
//! operates on it:
//!
//! - CRUD for applications, services, instances, manifests and history
//! - the optimistic-concurrency update protocol
//! - attribute resolution into zone parameters and zone config
//! - the VM lifecycle behind instances, via an injected [`ComputeApi`]
//! - the one-way upgrade from proto mode (local store) to full mode (Moray)
//!
//! # Architecture
//!
//! ```text
//! Model
//!   ├── active ObjectStore (LocalStore → TransitionStore → MorayLocalStore)
//!   ├── attributes (pure resolver)
//!   ├── ComputeApi / CommandRunner (full mode only)
//!   ├── SchemaValidator (metadata_schema)
//!   └── ProtoMarker + FullModeBackends (upgrade)
//! ```

pub mod applications;
pub mod attributes;
pub mod error;
pub mod external;
pub mod history;
pub mod instances;
pub mod jobs;
pub mod manifests;
pub mod migration;
pub mod model;
pub mod payload;
pub mod services;

pub use attributes::{Field, InstanceChain, ZoneConfig};
pub use error::{ExternalKind, ModelError, ModelResult};
pub use external::{
    CommandRunner, ComputeApi, CreateVmOptions, FileProtoMarker, FullModeBackends, Job, JobExecution,
    JsonSchemaValidator, ProtoMarker, SchemaValidator, Vm,
};
pub use instances::CreateInstanceOptions;
pub use migration::CopyStats;
pub use model::{Mode, Model, ModelConfig};
