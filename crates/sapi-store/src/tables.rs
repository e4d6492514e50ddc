//! Moray bucket definitions for the registry.
//!
//! Every bucket is keyed by object UUID. The indexed fields are the ones
//! list queries filter on; filtering on anything else is rejected by Moray.

use std::collections::BTreeMap;

use sapi_core::Bucket;
use serde::{Deserialize, Serialize};

/// Bumped whenever an index is added, so existing buckets get updated.
pub const SCHEMA_VERSION: u32 = 2;

/// Indexed value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    #[serde(rename = "type")]
    pub kind: IndexType,
    #[serde(default)]
    pub unique: bool,
}

/// Bucket configuration as stored by Moray.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSchema {
    pub index: BTreeMap<String, IndexSpec>,
    pub version: u32,
}

impl BucketSchema {
    pub fn is_indexed(&self, field: &str) -> bool {
        self.index.contains_key(field)
    }
}

/// Index layout for a registry bucket.
pub fn bucket_schema(bucket: Bucket) -> BucketSchema {
    let string = |unique| IndexSpec {
        kind: IndexType::String,
        unique,
    };
    let mut index = BTreeMap::new();
    index.insert("uuid".to_string(), string(true));

    let extra: &[&str] = match bucket {
        Bucket::Applications => &["name", "owner_uuid"],
        Bucket::Services => &["name", "application_uuid", "type"],
        Bucket::Instances => &["service_uuid", "type"],
        Bucket::Manifests => &["name"],
        Bucket::History => &[],
    };
    for field in extra {
        index.insert((*field).to_string(), string(false));
    }
    if bucket == Bucket::History {
        index.insert(
            "started".to_string(),
            IndexSpec {
                kind: IndexType::Number,
                unique: false,
            },
        );
    }

    BucketSchema {
        index,
        version: SCHEMA_VERSION,
    }
}
