//! Registry object types shared across SAPI crates.
//!
//! Every object is persisted as a whole JSON document in a bucket keyed by
//! its UUID. The `params`, `metadata`, `metadata_schema` and `manifests`
//! fields are free-form maps composed across the Application → Service →
//! Instance chain by the attribute resolver.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// UUID of any registry object, kept in its canonical string form.
pub type ObjectUuid = String;

/// Free-form attribute map (`params`, `metadata`).
pub type Attributes = Map<String, Value>;

/// Manifest references: manifest name → manifest UUID.
pub type ManifestRefs = BTreeMap<String, ObjectUuid>;

/// Default version assigned to manifests created without one.
pub const DEFAULT_MANIFEST_VERSION: &str = "1.0.0";

// ── Buckets ───────────────────────────────────────────────────────

/// A named collection of objects of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Applications,
    Services,
    Instances,
    Manifests,
    History,
}

impl Bucket {
    /// Every bucket, in provisioning order.
    pub const ALL: [Bucket; 5] = [
        Bucket::Applications,
        Bucket::Services,
        Bucket::Instances,
        Bucket::Manifests,
        Bucket::History,
    ];

    /// Storage-level bucket name (directory name locally, bucket name in Moray).
    pub fn name(self) -> &'static str {
        match self {
            Bucket::Applications => "sapi_applications",
            Bucket::Services => "sapi_services",
            Bucket::Instances => "sapi_instances",
            Bucket::Manifests => "sapi_manifests",
            Bucket::History => "sapi_history",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Bucket {
    type Err = String;

    /// Accepts both the short (`applications`) and storage (`sapi_applications`) names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = s.strip_prefix("sapi_").unwrap_or(s);
        match short {
            "applications" => Ok(Bucket::Applications),
            "services" => Ok(Bucket::Services),
            "instances" => Ok(Bucket::Instances),
            "manifests" => Ok(Bucket::Manifests),
            "history" => Ok(Bucket::History),
            other => Err(format!("unknown bucket: {other}")),
        }
    }
}

// ── Change actions ────────────────────────────────────────────────

/// How an `update*` request is applied to a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Merge keys into the existing maps.
    #[default]
    Update,
    /// Replace each named map wholesale.
    Replace,
    /// Remove the named keys from each map.
    Delete,
    /// Reset the object to the change, keeping unnamed keys (history only).
    Set,
}

impl FromStr for ChangeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(ChangeAction::Update),
            "replace" => Ok(ChangeAction::Replace),
            "delete" => Ok(ChangeAction::Delete),
            "set" => Ok(ChangeAction::Set),
            other => Err(format!("invalid action: {other}")),
        }
    }
}

// ── Service type ──────────────────────────────────────────────────

/// Whether instances of a service are backed by a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    Vm,
    Agent,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Vm => "vm",
            ServiceType::Agent => "agent",
        }
    }
}

// ── Entities ──────────────────────────────────────────────────────

/// An object kind stored in exactly one bucket.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const BUCKET: Bucket;

    fn uuid(&self) -> &str;

    fn set_uuid(&mut self, uuid: ObjectUuid);
}

/// Root of a hierarchy. Owns zero or more services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Application {
    #[serde(default)]
    pub uuid: ObjectUuid,
    pub name: String,
    pub owner_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<ManifestRefs>,
    /// Route writes to the master datacenter's Moray when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<bool>,
}

/// A service belongs to exactly one application and owns instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Service {
    #[serde(default)]
    pub uuid: ObjectUuid,
    pub name: String,
    pub application_uuid: ObjectUuid,
    #[serde(rename = "type", default)]
    pub kind: ServiceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<ManifestRefs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<bool>,
}

/// A provisioned zone (or agent) of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Instance {
    #[serde(default)]
    pub uuid: ObjectUuid,
    pub service_uuid: ObjectUuid,
    /// Copied from the service at creation and fixed thereafter.
    #[serde(rename = "type", default)]
    pub kind: ServiceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<ManifestRefs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<String>,
    /// A backing VM already exists; skip provisioning. Never persisted.
    #[serde(default, skip_serializing)]
    pub exists: bool,
}

/// A configuration file template consumed by the in-zone config agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub uuid: ObjectUuid,
    pub name: String,
    pub path: String,
    pub template: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_cmd: Option<String>,
    #[serde(default = "default_manifest_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<bool>,
}

fn default_manifest_version() -> String {
    DEFAULT_MANIFEST_VERSION.to_string()
}

/// Audit record of a change made through the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HistoryEntry {
    #[serde(default)]
    pub uuid: ObjectUuid,
    /// Milliseconds since the Unix epoch.
    pub started: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<i64>,
    #[serde(default)]
    pub changes: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! impl_entity {
    ($ty:ty, $bucket:expr) => {
        impl Entity for $ty {
            const BUCKET: Bucket = $bucket;

            fn uuid(&self) -> &str {
                &self.uuid
            }

            fn set_uuid(&mut self, uuid: ObjectUuid) {
                self.uuid = uuid;
            }
        }
    };
}

impl_entity!(Application, Bucket::Applications);
impl_entity!(Service, Bucket::Services);
impl_entity!(Instance, Bucket::Instances);
impl_entity!(Manifest, Bucket::Manifests);
impl_entity!(HistoryEntry, Bucket::History);
