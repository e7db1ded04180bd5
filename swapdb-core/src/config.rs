//! # Configuration Management
//!
//! Handles all configuration for swapdb components.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::types::{ForkStrategy, Partition};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub maintenance: MaintenanceConfig,
    pub fork: ForkConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_path("read config", path)?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Configuration {
            message: format!("{}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.maintenance.hz == 0 {
            return Err(Error::Configuration {
                message: "maintenance.hz must be > 0".to_string(),
            });
        }
        if self.maintenance.meta_flush_delete_percentage > 100 {
            return Err(Error::Configuration {
                message: "maintenance.meta_flush_delete_percentage must be <= 100".to_string(),
            });
        }
        if self.engine.background_workers == 0 {
            return Err(Error::Configuration {
                message: "engine.background_workers must be > 0".to_string(),
            });
        }
        for partition in Partition::ALL {
            let p = self.engine.partitions.get(partition);
            if p.memtable_size == 0 || p.max_memtable_entries == 0 {
                return Err(Error::Configuration {
                    message: format!("partition {} has a zero memtable limit", partition),
                });
            }
        }
        Ok(())
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding every epoch directory and transient checkpoints
    pub base_dir: PathBuf,
    /// Keep existing data across restarts instead of starting from an empty epoch
    pub persistence_enabled: bool,
    pub partitions: PartitionConfigs,
    /// Flush active memtables older than this many seconds (0 disables)
    pub periodic_flush_secs: u64,
    /// Upper bound on waiting for engine background work during close
    pub cancel_timeout: Duration,
    /// Worker threads for the background task queue
    pub background_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data.swap"),
            persistence_enabled: false,
            partitions: PartitionConfigs::default(),
            periodic_flush_secs: 3600,
            cancel_timeout: Duration::from_secs(5),
            background_workers: 4,
        }
    }
}

/// Per-partition tuning, opaque to the lifecycle code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Active memtable byte size that triggers rotation
    pub memtable_size: usize,
    /// Active memtable entry count that triggers rotation
    pub max_memtable_entries: usize,
    /// Immutable memtables allowed before writers flush inline
    pub max_immutable_memtables: usize,
    /// Verify segment checksums on open
    pub verify_checksums: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            memtable_size: 64 * 1024 * 1024, // 64MB
            max_memtable_entries: 1_000_000,
            max_immutable_memtables: 4,
            verify_checksums: true,
        }
    }
}

/// One `PartitionConfig` per partition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfigs {
    pub data: PartitionConfig,
    pub meta: PartitionConfig,
    pub score: PartitionConfig,
}

impl Default for PartitionConfigs {
    fn default() -> Self {
        Self {
            data: PartitionConfig::default(),
            meta: PartitionConfig {
                memtable_size: 16 * 1024 * 1024, // 16MB
                ..PartitionConfig::default()
            },
            score: PartitionConfig {
                memtable_size: 16 * 1024 * 1024,
                ..PartitionConfig::default()
            },
        }
    }
}

impl PartitionConfigs {
    pub fn get(&self, partition: Partition) -> &PartitionConfig {
        match partition {
            Partition::Data => &self.data,
            Partition::Meta => &self.meta,
            Partition::Score => &self.score,
        }
    }

    pub fn get_mut(&mut self, partition: Partition) -> &mut PartitionConfig {
        match partition {
            Partition::Data => &mut self.data,
            Partition::Meta => &mut self.meta,
            Partition::Score => &mut self.score,
        }
    }

    /// Same configuration for every partition
    pub fn uniform(config: PartitionConfig) -> Self {
        Self {
            data: config.clone(),
            meta: config.clone(),
            score: config,
        }
    }
}

/// Periodic maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Cron ticks per second
    pub hz: u32,
    pub usage_check_period_ms: u64,
    pub stats_refresh_period_ms: u64,
    /// Advisory limit on total on-disk size (0 = unlimited)
    pub max_db_size: u64,
    /// Minimum delete/entry percentage in meta memtables that triggers a flush
    pub meta_flush_delete_percentage: u32,
    /// Minimum absolute delete count in meta memtables that triggers a flush
    pub meta_flush_delete_floor: u64,
    /// Sentinel file rewritten under the base directory on every tick
    pub health_file: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            hz: 10,
            usage_check_period_ms: 1000,
            stats_refresh_period_ms: 5000,
            max_db_size: 0,
            meta_flush_delete_percentage: 40,
            meta_flush_delete_floor: 100_000,
            health_file: "disk_health".to_string(),
        }
    }
}

/// Fork consistency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    pub strategy: ForkStrategy,
    /// How long one writable wait on the handoff pipe may block a worker
    pub handoff_wait_timeout: Duration,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            strategy: ForkStrategy::Snapshot,
            handoff_wait_timeout: Duration::from_millis(100),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}
