//! sapi-core: registry object types and configuration.

pub mod config;
pub mod types;

pub use config::SapiConfig;
pub use types::*;
