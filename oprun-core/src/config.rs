//! Node configuration
//!
//! Loaded from a YAML file; every field has a default so an empty document is
//! a valid config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::events::DEFAULT_EVENT_BUFFER;
use crate::stream::DEFAULT_MAX_LINE_BYTES;

/// Env var naming the config file.
pub const CONFIG_ENV: &str = "OPRUN_CONFIG";
/// Env var overriding `data_dir`.
pub const DATA_DIR_ENV: &str = "OPRUN_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root of all node-owned state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Capacity of each run's event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Longest container output line published as one event.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Directories searched for relative op refs, in order.
    #[serde(default = "default_op_search_paths")]
    pub op_search_paths: Vec<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./.oprun")
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_op_search_paths() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            event_buffer: default_event_buffer(),
            max_line_bytes: default_max_line_bytes(),
            op_search_paths: default_op_search_paths(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Config from `OPRUN_CONFIG` (defaults when unset), with
    /// `OPRUN_DATA_DIR` applied on top.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_ENV) {
            Some(path) => {
                tracing::info!(path = %path, "Loading node configuration");
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        if let Some(data_dir) = lookup(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(data_dir);
        }
        Ok(config)
    }

    /// Where containers get scratch files and dirs.
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("dcg")
    }
}
