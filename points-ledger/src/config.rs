//! Configuration for the points ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Posting rules and writer layout
    pub ledger: LedgerConfig,

    /// Expiry sweep schedule
    pub sweep: SweepConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/points"),
            service_name: "points-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            ledger: LedgerConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync the WAL on every commit
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

/// Posting rules and writer layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Validity window for newly created accounts' earned points
    pub default_expiry_days: u32,

    /// Number of single-writer shards (accounts are routed by user id)
    pub shards: usize,

    /// Bounded mailbox size per shard
    pub mailbox_capacity: usize,

    /// Replay earn/redeem/refund calls that carry an already-posted reference
    pub deduplicate_references: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_expiry_days: 365,
            shards: 8,
            mailbox_capacity: 1000,
            deduplicate_references: true,
        }
    }
}

/// Expiry sweep schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Horizon for expiring-soon notices
    pub notify_within_days: u32,

    /// Max expired earn records inspected per sweep
    pub batch_limit: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            notify_within_days: 7,
            batch_limit: 10_000,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("POINTS_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(shards) = std::env::var("POINTS_SHARDS") {
            config.ledger.shards = parse_env("POINTS_SHARDS", &shards)?;
        }

        if let Ok(days) = std::env::var("POINTS_DEFAULT_EXPIRY_DAYS") {
            config.ledger.default_expiry_days = parse_env("POINTS_DEFAULT_EXPIRY_DAYS", &days)?;
        }

        if let Ok(secs) = std::env::var("POINTS_SWEEP_INTERVAL_SECS") {
            config.sweep.interval_secs = parse_env("POINTS_SWEEP_INTERVAL_SECS", &secs)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.ledger.shards == 0 {
            return Err(crate::Error::Config("ledger.shards must be at least 1".into()));
        }
        if self.ledger.mailbox_capacity == 0 {
            return Err(crate::Error::Config(
                "ledger.mailbox_capacity must be at least 1".into(),
            ));
        }
        if self.ledger.default_expiry_days == 0 {
            return Err(crate::Error::Config(
                "ledger.default_expiry_days must be at least 1".into(),
            ));
        }
        if self.sweep.batch_limit == 0 {
            return Err(crate::Error::Config("sweep.batch_limit must be at least 1".into()));
        }
        if self.sweep.interval_secs == 0 {
            return Err(crate::Error::Config("sweep.interval_secs must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{} has invalid value '{}'", name, value)))
}
