use std::path::Path;

use common::SerdeFormatError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource_cache::DEFAULT_MAX_OPEN_FILES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Format(#[from] SerdeFormatError),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    /// Largest allowed group; `0` means unlimited.
    pub hard_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub max_open_files: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Worker threads; `0` picks one per CPU.
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Objects allowed between receipt and emission; `0` means unbounded.
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub grouping: GroupingConfig,
    pub resources: ResourceConfig,
    pub threads: ThreadConfig,
    pub prefetch: PrefetchConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grouping: GroupingConfig::default(),
            resources: ResourceConfig::default(),
            threads: ThreadConfig::default(),
            prefetch: PrefetchConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads YAML or JSON, picked by the file extension.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Ok(common::deserialize_file(path)?)
    }

    pub fn parse(text: &str, format: common::FileFormat) -> ConfigResult<Self> {
        Ok(common::deserialize(text, format)?)
    }

    pub fn build_thread_pool(&self) -> ConfigResult<rayon::ThreadPool> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads.count)
            .thread_name(|index| format!("extraction-worker-{index}"))
            .build()?;
        Ok(pool)
    }

    pub fn log_config(&self) -> common::log_setup::LogConfig {
        common::log_setup::LogConfig::with_level(self.log_level.clone())
    }
}
