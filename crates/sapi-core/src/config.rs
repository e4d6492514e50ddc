//! sapi.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SapiConfig {
    /// Root for on-disk state (local store, proto-mode marker).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// UUID of the zone this process runs in.
    pub zone_id: Option<String>,
    #[serde(default)]
    pub local_store: LocalStoreSection,
    #[serde(default)]
    pub moray: MoraySection,
    #[serde(default)]
    pub model: ModelSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreSection {
    /// Defaults to `<data_dir>/store`.
    pub path: Option<PathBuf>,
    #[serde(default = "default_list_concurrency")]
    pub list_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoraySection {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_init_retry_secs")]
    pub init_retry_secs: u64,
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_update_retries")]
    pub update_retries: u32,
    #[serde(default = "default_update_backoff_ms")]
    pub update_backoff_ms: u64,
    #[serde(default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,
    #[serde(default = "default_job_poll_attempts")]
    pub job_poll_attempts: u32,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/sapi")
}

fn default_list_concurrency() -> usize {
    10
}

fn default_page_size() -> usize {
    1000
}

fn default_init_retry_secs() -> u64 {
    5
}

fn default_init_timeout_secs() -> u64 {
    10
}

fn default_refresh_interval_secs() -> u64 {
    3600
}

fn default_update_retries() -> u32 {
    3
}

fn default_update_backoff_ms() -> u64 {
    1000
}

fn default_job_poll_interval_ms() -> u64 {
    1000
}

fn default_job_poll_attempts() -> u32 {
    600
}

impl Default for LocalStoreSection {
    fn default() -> Self {
        Self {
            path: None,
            list_concurrency: default_list_concurrency(),
        }
    }
}

impl Default for MoraySection {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            init_retry_secs: default_init_retry_secs(),
            init_timeout_secs: default_init_timeout_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            update_retries: default_update_retries(),
            update_backoff_ms: default_update_backoff_ms(),
            job_poll_interval_ms: default_job_poll_interval_ms(),
            job_poll_attempts: default_job_poll_attempts(),
        }
    }
}

impl Default for SapiConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            zone_id: None,
            local_store: LocalStoreSection::default(),
            moray: MoraySection::default(),
            model: ModelSection::default(),
        }
    }
}

impl SapiConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SapiConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Directory holding the local object store.
    pub fn local_store_path(&self) -> PathBuf {
        self.local_store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("store"))
    }

    /// File whose presence means the registry still runs in proto mode.
    pub fn proto_marker_path(&self) -> PathBuf {
        self.data_dir.join("proto_mode")
    }
}
