use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_OCDPO_POOL_SIZE: usize = 4;

/// Node-local configuration: everything a single process needs to start
/// up, independent of whatever group-communication/membership substrate
/// it's wired to. Loaded via `confy`: every field is `Option<T>` with a
/// `Default` impl and accessor methods that fall back to a constant, so an
/// on-disk config missing a newly added field still loads cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    version: u8,

    /// Root directory for pool-directory metadata and shard data, default
    /// `./data`.
    data_dir: Option<PathBuf>,

    log_dir: Option<PathBuf>,

    log_level: Option<String>,

    /// `StoreOptions::evaluation_mode` for every shard this node opens.
    pub evaluation_mode: Option<bool>,

    /// `Dispatcher::new`'s shared worker pool size.
    ocdpo_pool_size: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            version: 0,
            data_dir: None,
            log_dir: None,
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            evaluation_mode: Some(false),
            ocdpo_pool_size: Some(DEFAULT_OCDPO_POOL_SIZE),
        }
    }
}

impl NodeConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }

    pub fn evaluation_mode(&self) -> bool {
        self.evaluation_mode.unwrap_or(false)
    }

    pub fn ocdpo_pool_size(&self) -> usize {
        self.ocdpo_pool_size.unwrap_or(DEFAULT_OCDPO_POOL_SIZE)
    }
}
