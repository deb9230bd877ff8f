//! Repository configuration via `itemdb.toml`
//!
//! On first create a commented default `itemdb.toml` is written into the
//! repository directory. To change settings, edit the file and reopen.
//! A config passed explicitly at create time is written back instead, so
//! later opens pick it up.

use itemdb_concurrency::RetryConfig;
use itemdb_core::ItemDbError;
use itemdb_durability::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file name placed in the repository directory.
pub const CONFIG_FILE_NAME: &str = "itemdb.toml";

/// Errors reading or writing `itemdb.toml`
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("Config file '{path}': {source}")]
    Io {
        /// Offending file
        path: PathBuf,
        /// Underlying failure
        source: std::io::Error,
    },

    /// File is not valid TOML for this struct
    #[error("Failed to parse config file '{path}': {message}")]
    Parse {
        /// Offending file
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// A field holds an unsupported value
    #[error("Invalid {field} '{value}' in itemdb.toml: {message}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// Value found
        value: String,
        /// What is accepted
        message: String,
    },
}

impl From<ConfigError> for ItemDbError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Io { source, .. } => ItemDbError::Io(source),
            other => ItemDbError::InvalidOperation(other.to_string()),
        }
    }
}

/// Repository configuration loaded from `itemdb.toml`.
///
/// # Example
///
/// ```toml
/// durability = "standard"
/// checkpoint_interval_secs = 300
/// view_cache_size = 10000
///
/// [retry]
/// base_delay_ms = 10
/// max_delay_ms = 200
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Durability mode: `"standard"`, `"always"` or `"cache"`.
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Seconds between background checkpoints.
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Run the checkpoint thread.
    #[serde(default = "default_true")]
    pub checkpoint_enabled: bool,
    /// Run the full-text indexer thread.
    #[serde(default = "default_true")]
    pub indexer_enabled: bool,
    /// Milliseconds the indexer sleeps when caught up.
    #[serde(default = "default_indexer_poll_ms")]
    pub indexer_poll_ms: u64,
    /// Write lock wait before a deadlock is reported.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Clean items a view keeps before pruning.
    #[serde(default = "default_view_cache_size")]
    pub view_cache_size: usize,
    /// Snapshots kept after each checkpoint.
    #[serde(default = "default_snapshots_kept")]
    pub snapshots_kept: usize,
    /// Deadlock retry backoff.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_durability_str() -> String {
    "standard".to_string()
}

fn default_checkpoint_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_indexer_poll_ms() -> u64 {
    200
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_view_cache_size() -> usize {
    10_000
}

fn default_snapshots_kept() -> usize {
    2
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            durability: default_durability_str(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            checkpoint_enabled: true,
            indexer_enabled: true,
            indexer_poll_ms: default_indexer_poll_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            view_cache_size: default_view_cache_size(),
            snapshots_kept: default_snapshots_kept(),
            retry: RetryConfig::default(),
        }
    }
}

impl RepositoryConfig {
    /// Config for tests and in-memory repositories: no threads, cache mode
    pub fn quiet() -> Self {
        Self {
            durability: "cache".to_string(),
            checkpoint_enabled: false,
            indexer_enabled: false,
            ..Self::default()
        }
    }

    /// Parse the durability string into a `DurabilityMode`.
    pub fn durability_mode(&self) -> Result<DurabilityMode, ConfigError> {
        self.durability
            .parse::<DurabilityMode>()
            .map_err(|_| ConfigError::Invalid {
                field: "durability",
                value: self.durability.clone(),
                message: "expected \"standard\", \"always\" or \"cache\"".to_string(),
            })
    }

    /// Checkpoint interval as a `Duration`
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Indexer idle poll as a `Duration`
    pub fn indexer_poll(&self) -> Duration {
        Duration::from_millis(self.indexer_poll_ms)
    }

    /// Lock timeout as a `Duration`
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Reject values that parse but cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.durability_mode()?;
        if self.checkpoint_enabled && self.checkpoint_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "checkpoint_interval_secs",
                value: "0".to_string(),
                message: "must be positive when checkpoints are enabled".to_string(),
            });
        }
        if self.indexer_enabled && self.indexer_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "indexer_poll_ms",
                value: "0".to_string(),
                message: "must be positive when the indexer is enabled".to_string(),
            });
        }
        if self.snapshots_kept == 0 {
            return Err(ConfigError::Invalid {
                field: "snapshots_kept",
                value: "0".to_string(),
                message: "at least one snapshot must be kept".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# itemdb repository configuration
#
# Durability mode: "standard" (default), "always" or "cache"
#   "standard" = periodic fsync (~100ms), may lose the last interval on crash
#   "always"   = fsync every commit, zero data loss
#   "cache"    = no commit log, everything since the last checkpoint is lost on crash
durability = "standard"

# Background checkpoint thread
checkpoint_enabled = true
checkpoint_interval_secs = 300

# Snapshots kept after each checkpoint
snapshots_kept = 2

# Background full-text indexer
indexer_enabled = true
indexer_poll_ms = 200

# How long a commit waits for the write lock before retrying (milliseconds)
lock_timeout_ms = 1000

# Clean items a view keeps cached before pruning
view_cache_size = 10000

# Deadlock retry backoff
[retry]
base_delay_ms = 10
max_delay_ms = 200
jitter = true
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RepositoryConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
