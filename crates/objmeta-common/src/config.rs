//! Configuration types for objmeta
//!
//! Every section has a `Default`, so a config file only needs to name the
//! values it changes.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for objmeta
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Persistent store configuration
    pub store: StoreConfig,
    /// Cache configuration
    pub cache: CacheConfig,
    /// Usage accounting configuration
    pub accounting: AccountingConfig,
    /// Admin endpoint configuration
    pub admin: AdminConfig,
    /// Archival retrieval service configuration
    pub archive: ArchiveConfig,
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Data directory for local state
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "objmeta-node".to_string(),
            data_dir: PathBuf::from("/var/lib/objmeta"),
        }
    }
}

/// Persistent store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the metadata database file
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/objmeta/meta.redb"),
        }
    }
}

/// Cache engine selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheEngine {
    /// Redis server; counters survive a restart of this process
    #[default]
    Redis,
    /// In-process map; unflushed usage is lost when the process exits
    Memory,
}

/// Cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Engine backing the cache
    pub engine: CacheEngine,
    /// Redis connection URL
    pub url: String,
    /// Deadline applied to every cache and store call (milliseconds)
    pub op_timeout_ms: u64,
    /// Collapse concurrent cache misses for the same key into one load
    pub single_flight: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            engine: CacheEngine::Redis,
            url: "redis://127.0.0.1:6379/0".to_string(),
            op_timeout_ms: 3_000,
            single_flight: true,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Usage accounting configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Interval between dirty-usage flush cycles (milliseconds)
    pub flush_interval_ms: u64,
    /// Stages slower than this are logged as slow (milliseconds)
    pub slow_threshold_ms: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 10_000,
            slow_threshold_ms: 100,
        }
    }
}

impl AccountingConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub const fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }
}

/// Admin HTTP endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Address for the metrics/health endpoint
    pub listen: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9095)),
        }
    }
}

/// Archival retrieval service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Base URL of the archival service; unset disables the client
    pub endpoint: Option<String>,
    /// Account id used when none is given per call
    pub account_id: String,
    /// Request timeout (milliseconds)
    pub timeout_ms: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            account_id: "-".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl ArchiveConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
