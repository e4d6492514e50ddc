//! sapi-store: pluggable object stores for the SAPI registry.
//!
//! Every backend implements [`ObjectStore`]: whole-object JSON documents
//! addressed by `(bucket, uuid)`, with etag preconditions on write.
//!
//! # Backends
//!
//! - **`local`**: one JSON file per object; the proto-mode store and the
//!   cache behind Moray.
//! - **`moray_store`**: Moray-backed store with an optional master
//!   datacenter connection.
//! - **`moray_local`**: Moray with a local cache fallback for reads and a
//!   periodic cache rebuild.
//! - **`transition`**: dual-write proxy used while migrating off the local
//!   store.
//!
//! Stores are `Send + Sync` and meant to be shared as `Arc<dyn ObjectStore>`.

pub mod error;
pub mod local;
pub mod memory;
pub mod moray;
pub mod moray_local;
pub mod moray_store;
pub mod store;
pub mod tables;
pub mod transition;

pub use error::{StoreError, StoreResult};
pub use local::{LocalStore, LocalStoreConfig};
pub use memory::MemoryMoray;
pub use moray::{FindOptions, MorayClient};
pub use moray_local::{
    DEFAULT_REFRESH_INTERVAL, MorayLocalStore, RefreshStats, StaticZoneIdentity, ZoneIdentity,
};
pub use moray_store::{MorayStore, MorayStoreConfig};
pub use store::{Filters, ObjectStore, PutOptions, ReadOptions, StoredObject};
pub use transition::TransitionStore;
