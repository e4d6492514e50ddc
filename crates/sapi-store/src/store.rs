//! The `ObjectStore` contract shared by every persistence backend.
//!
//! Objects are whole JSON documents addressed by `(bucket, uuid)`. Stores
//! report an opaque etag on read and honor an etag precondition on write,
//! which is what the model's optimistic update protocol is built on.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use sapi_core::Bucket;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StoreResult;

/// Field the reserved `since`/`until` filters range over.
pub const STARTED_FIELD: &str = "started";

/// A stored object together with its version tag.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub value: Value,
    pub etag: Option<String>,
}

/// Options for reads and listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Also query the master datacenter's Moray, when one is connected.
    pub include_master: bool,
}

/// Options for writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Fail with an etag conflict unless the stored object carries this etag.
    pub etag: Option<String>,
}

impl PutOptions {
    pub fn with_etag(etag: Option<String>) -> Self {
        Self { etag }
    }
}

/// Listing filter: exact-match fields plus an optional range on `started`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters {
    eq: BTreeMap<String, Value>,
    since: Option<i64>,
    until: Option<i64>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.insert(key.into(), value.into());
        self
    }

    pub fn since(mut self, millis: i64) -> Self {
        self.since = Some(millis);
        self
    }

    pub fn until(mut self, millis: i64) -> Self {
        self.until = Some(millis);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.eq.is_empty() && self.since.is_none() && self.until.is_none()
    }

    pub fn has_range(&self) -> bool {
        self.since.is_some() || self.until.is_some()
    }

    /// Names of every field this filter touches.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.eq
            .keys()
            .map(String::as_str)
            .chain(self.has_range().then_some(STARTED_FIELD))
    }

    /// Whether `obj` satisfies every condition.
    pub fn matches(&self, obj: &Value) -> bool {
        let equal = self.eq.iter().all(|(key, wanted)| {
            obj.get(key)
                .is_some_and(|field| field_matches(field, wanted))
        });
        if !equal {
            return false;
        }
        if !self.has_range() {
            return true;
        }
        let Some(started) = obj.get(STARTED_FIELD).and_then(as_millis) else {
            return false;
        };
        self.since.is_none_or(|since| started >= since)
            && self.until.is_none_or(|until| started <= until)
    }

    /// LDAP-style rendering, as Moray filters are written.
    pub fn to_ldap(&self) -> String {
        let mut clauses = Vec::new();
        for (key, value) in &self.eq {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            clauses.push(format!("({key}={rendered})"));
        }
        if let Some(since) = self.since {
            clauses.push(format!("({STARTED_FIELD}>={since})"));
        }
        if let Some(until) = self.until {
            clauses.push(format!("({STARTED_FIELD}<={until})"));
        }
        match clauses.len() {
            0 => "(uuid=*)".to_string(),
            1 => clauses.remove(0),
            _ => {
                let mut out = String::from("(&");
                for clause in clauses {
                    let _ = write!(out, "{clause}");
                }
                out.push(')');
                out
            }
        }
    }
}

/// Query parameters arrive as strings, stored fields may not be.
fn field_matches(field: &Value, wanted: &Value) -> bool {
    if field == wanted {
        return true;
    }
    match (field, wanted) {
        (Value::Bool(_) | Value::Number(_), Value::String(s)) => field.to_string() == *s,
        _ => false,
    }
}

fn as_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Content-derived etag.
pub fn content_etag(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..8])
}

/// A persistence backend for registry objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Prepare buckets/directories. Called once before use.
    async fn init(&self) -> StoreResult<()>;

    async fn put_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        value: &Value,
        opts: &PutOptions,
    ) -> StoreResult<()>;

    /// `Ok(None)` when the object does not exist.
    async fn get_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        opts: &ReadOptions,
    ) -> StoreResult<Option<StoredObject>>;

    /// Fails with `NotFound` when the object does not exist.
    async fn del_object(&self, bucket: Bucket, uuid: &str) -> StoreResult<()>;

    async fn list_object_values(
        &self,
        bucket: Bucket,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> StoreResult<Vec<Value>>;

    async fn ping(&self) -> StoreResult<()>;

    async fn close(&self);

    /// Force the backend to reconcile any cached state. No-op by default.
    async fn sync(&self) -> StoreResult<()> {
        Ok(())
    }
}
