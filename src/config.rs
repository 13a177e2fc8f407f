//! Cache configuration and its TOML representation.
//!
//! ```toml
//! [cache]
//! initial_capacity = 16
//! max_capacity = 65536
//! retained_executors = 64
//! prepare_eagerly = true
//! ```
//!
//! Every key is optional; missing keys keep their [`CacheConfig::default`]
//! values.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest table capacity any configuration may request.
pub const CAPACITY_LIMIT: usize = 1 << 31;

/// Tuning knobs for [`StatementCache`](crate::query::StatementCache).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Slot count of a fresh table. Power of two.
    pub initial_capacity: usize,
    /// Growth ceiling; at this size collisions evict instead of resizing.
    /// Power of two, at least `initial_capacity`.
    pub max_capacity: usize,
    /// Executors kept alive by the least-recently-used retention set. `0`
    /// keeps only executors callers pin themselves.
    pub retained_executors: usize,
    /// Prepare statements at synthesis instead of on first execution.
    pub prepare_eagerly: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            max_capacity: 1 << 16,
            retained_executors: 64,
            prepare_eagerly: true,
        }
    }
}

impl CacheConfig {
    /// Small footprint for caches serving a handful of bitmasks.
    pub fn compact() -> Self {
        Self {
            max_capacity: 1 << 10,
            retained_executors: 8,
            ..Self::default()
        }
    }

    /// Wide tables and a deep retention set for many distinct bitmasks.
    pub fn throughput() -> Self {
        Self {
            initial_capacity: 64,
            max_capacity: 1 << 20,
            retained_executors: 512,
            prepare_eagerly: true,
        }
    }

    /// Checks capacity invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.initial_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "initial_capacity",
                reason: format!("{} is not a power of two", self.initial_capacity),
            });
        }
        if !self.max_capacity.is_power_of_two() || self.max_capacity > CAPACITY_LIMIT {
            return Err(ConfigError::Invalid {
                field: "max_capacity",
                reason: format!(
                    "{} is not a power of two no larger than {CAPACITY_LIMIT}",
                    self.max_capacity
                ),
            });
        }
        if self.max_capacity < self.initial_capacity {
            return Err(ConfigError::Invalid {
                field: "max_capacity",
                reason: format!(
                    "{} is smaller than initial_capacity {}",
                    self.max_capacity, self.initial_capacity
                ),
            });
        }
        Ok(())
    }

    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            origin: path.display().to_string(),
            source,
        })?;
        raw.into_config()
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            origin: "<inline>".to_owned(),
            source,
        })?;
        raw.into_config()
    }

    /// Writes the configuration as TOML, creating parent directories.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let target = path.as_ref();
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let raw = RawConfig {
            cache: RawCacheSection {
                initial_capacity: Some(self.initial_capacity),
                max_capacity: Some(self.max_capacity),
                retained_executors: Some(self.retained_executors),
                prepare_eagerly: Some(self.prepare_eagerly),
            },
        };
        let serialized =
            toml::to_string_pretty(&raw).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(target, serialized).map_err(|source| ConfigError::Write {
            path: target.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    cache: RawCacheSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawCacheSection {
    initial_capacity: Option<usize>,
    max_capacity: Option<usize>,
    retained_executors: Option<usize>,
    prepare_eagerly: Option<bool>,
}

impl RawConfig {
    fn into_config(self) -> Result<CacheConfig, ConfigError> {
        let defaults = CacheConfig::default();
        let raw = self.cache;
        let config = CacheConfig {
            initial_capacity: raw.initial_capacity.unwrap_or(defaults.initial_capacity),
            max_capacity: raw.max_capacity.unwrap_or(defaults.max_capacity),
            retained_executors: raw.retained_executors.unwrap_or(defaults.retained_executors),
            prepare_eagerly: raw.prepare_eagerly.unwrap_or(defaults.prepare_eagerly),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read cache config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },
    /// The TOML was malformed or had unknown keys.
    #[error("failed to parse cache config {origin}: {source}")]
    Parse {
        /// File path or `<inline>`.
        origin: String,
        /// Parser failure.
        source: toml::de::Error,
    },
    /// Serialization failed.
    #[error("failed to serialize cache config: {source}")]
    Serialize {
        /// Serializer failure.
        source: toml::ser::Error,
    },
    /// The file could not be written.
    #[error("failed to write cache config {path}: {source}")]
    Write {
        /// File path.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },
    /// A parent directory could not be created.
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },
    /// A value violates a capacity invariant.
    #[error("invalid cache config field '{field}': {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
