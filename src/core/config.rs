//! Repository configuration
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! read_only = false
//!
//! [cache]
//! max_items = 10000
//! eviction_ratio = 0.1
//! policy = "fifo"
//! statistics = true
//!
//! [key_locks]
//! max_rounds = 10
//! round_wait_ms = 6000
//! shards = 16
//!
//! [locks]
//! default_timeout_secs = 3600
//! max_timeout_secs = 604800
//! root_bypasses_locks = true
//!
//! [roles]
//! root = ["admin"]
//! read_everything = ["indexer"]
//! ```

use crate::core::acl::RoleConfig;
use crate::core::error::{RepositoryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Order in which cache entries are evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Oldest insertion first; hits do not reorder
    #[default]
    Fifo,
    /// Least recently used first; hits move an entry to the front
    Lru,
}

/// Resource cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached resources
    pub max_items: usize,
    /// Fraction of `max_items` evicted at once on overflow
    pub eviction_ratio: f64,
    pub policy: EvictionPolicy,
    /// Track hit/miss counters
    pub statistics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_items: 10_000,
            eviction_ratio: 0.1,
            policy: EvictionPolicy::Fifo,
            statistics: true,
        }
    }
}

impl CacheConfig {
    /// Entries removed per overflow: `max(1, max_items * eviction_ratio)`
    pub fn remove_items(&self) -> usize {
        ((self.max_items as f64 * self.eviction_ratio) as usize).max(1)
    }
}

/// Key lock table settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyLockConfig {
    /// Waits per key before giving up
    pub max_rounds: u32,
    /// Length of one wait, in milliseconds
    pub round_wait_ms: u64,
    /// Number of independently locked shards
    pub shards: usize,
}

impl Default for KeyLockConfig {
    fn default() -> Self {
        KeyLockConfig {
            max_rounds: 10,
            round_wait_ms: 6_000,
            shards: 16,
        }
    }
}

/// Resource lock settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Timeout used when the client does not ask for one
    pub default_timeout_secs: u64,
    /// Upper bound on requested timeouts
    pub max_timeout_secs: u64,
    /// Root callers may write through foreign locks
    pub root_bypasses_locks: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            default_timeout_secs: 3_600,
            max_timeout_secs: 7 * 24 * 3_600,
            root_bypasses_locks: true,
        }
    }
}

impl LockConfig {
    /// Requested timeout, defaulted and clamped
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_secs(self.max_timeout_secs);
        requested
            .unwrap_or(Duration::from_secs(self.default_timeout_secs))
            .min(max)
    }
}

/// Complete repository configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Start in maintenance mode (only Root may mutate)
    pub read_only: bool,
    pub cache: CacheConfig,
    pub key_locks: KeyLockConfig,
    pub locks: LockConfig,
    pub roles: RoleConfig,
}

impl RepositoryConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: RepositoryConfig =
            toml::from_str(toml).map_err(|e| RepositoryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RepositoryError::Config(format!("cannot read {:?}: {}", path.as_ref(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RepositoryError::Config(e.to_string()))
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_items == 0 {
            return Err(RepositoryError::Config(
                "cache.max_items must be at least 1".to_string(),
            ));
        }
        if !(self.cache.eviction_ratio > 0.0 && self.cache.eviction_ratio <= 1.0) {
            return Err(RepositoryError::Config(format!(
                "cache.eviction_ratio must be in (0, 1], got {}",
                self.cache.eviction_ratio
            )));
        }
        if self.key_locks.max_rounds == 0 {
            return Err(RepositoryError::Config(
                "key_locks.max_rounds must be at least 1".to_string(),
            ));
        }
        if self.key_locks.shards == 0 {
            return Err(RepositoryError::Config(
                "key_locks.shards must be at least 1".to_string(),
            ));
        }
        if self.locks.default_timeout_secs == 0 || self.locks.max_timeout_secs == 0 {
            return Err(RepositoryError::Config(
                "lock timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
