//! StationSync Configuration
//!
//! Configuration structures for the offline-first synchronization engine.
//! Every tunable carries a serde default so a minimal TOML file (store
//! ranges plus a client id) is enough to run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::RangeSpec;

/// Main StationSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSyncConfig {
    /// Station-specific configuration
    pub station: StationConfig,

    /// Remote store range layout
    pub store: StoreConfig,

    /// Durable write queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Distributed lock configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Processed-record cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Crash-recoverable state tracker configuration
    #[serde(default)]
    pub state: StateConfig,

    /// Sync orchestrator timers
    #[serde(default)]
    pub sync: SyncTimersConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Station-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Stable client identifier for this station session
    pub client_id: String,

    /// Data directory for the local durable database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Remote store range layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Sheet holding operational records
    #[serde(default = "default_data_sheet")]
    pub data_sheet: String,

    /// Open-ended cell range for appends and full reads
    #[serde(default = "default_data_cells")]
    pub data_cells: String,

    /// Sheet holding the lock register
    #[serde(default = "default_control_sheet")]
    pub control_sheet: String,

    /// Single cell used as the lease register
    #[serde(default = "default_control_cell")]
    pub control_cell: String,

    /// Zero-based column index of the primary dedup key
    #[serde(default = "default_primary_key_column")]
    pub primary_key_column: usize,

    /// Zero-based column index of the secondary dedup key (optional)
    #[serde(default = "default_secondary_key_column")]
    pub secondary_key_column: Option<usize>,

    /// Zero-based column index of the version marker
    #[serde(default = "default_version_column")]
    pub version_column: usize,

    /// Declared column types, driving integrity normalization.
    /// Columns beyond the list are treated as text.
    #[serde(default)]
    pub column_types: Vec<crate::integrity::ColumnType>,

    /// Read-mostly reference ranges refreshed on their own timer
    #[serde(default)]
    pub reference_ranges: Vec<RangeSpec>,
}

/// Durable write queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Delivery attempts before a record is quarantined
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
}

/// Distributed lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease time-to-live in milliseconds
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,

    /// Renewal interval in milliseconds (must stay below the TTL)
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,

    /// Maximum time to wait for acquisition in milliseconds
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Settle delay between token write and read-back in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Minimum retry backoff in milliseconds (jittered up to max)
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Processed-record cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Full snapshot refresh interval in milliseconds
    #[serde(default = "default_cache_refresh_ms")]
    pub refresh_interval_ms: u64,
}

/// Crash-recoverable state tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Age beyond which a persisted in-flight marker is a crash artifact,
    /// in milliseconds
    #[serde(default = "default_crash_threshold_ms")]
    pub crash_threshold_ms: u64,
}

/// Sync orchestrator timer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTimersConfig {
    /// Queue flush / operational poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Reference dataset refresh interval in milliseconds
    #[serde(default = "default_reference_interval_ms")]
    pub reference_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("./stationsync-data")
}

fn default_data_sheet() -> String {
    "BD".to_string()
}

fn default_data_cells() -> String {
    "A:Z".to_string()
}

fn default_control_sheet() -> String {
    "Control".to_string()
}

fn default_control_cell() -> String {
    "A1".to_string()
}

fn default_primary_key_column() -> usize {
    3
}

fn default_secondary_key_column() -> Option<usize> {
    Some(4)
}

fn default_version_column() -> usize {
    5
}

fn default_max_retry() -> u32 {
    3
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_renew_interval_ms() -> u64 {
    10_000
}

fn default_max_wait_ms() -> u64 {
    60_000
}

fn default_settle_ms() -> u64 {
    200
}

fn default_backoff_min_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    1_000
}

fn default_cache_refresh_ms() -> u64 {
    60 * 60 * 1000
}

fn default_crash_threshold_ms() -> u64 {
    5 * 60 * 1000
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_reference_interval_ms() -> u64 {
    30 * 60 * 1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            renew_interval_ms: default_renew_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
            settle_ms: default_settle_ms(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_cache_refresh_ms(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            crash_threshold_ms: default_crash_threshold_ms(),
        }
    }
}

impl Default for SyncTimersConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            reference_interval_ms: default_reference_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl StoreConfig {
    /// Full operational data range
    pub fn data_range(&self) -> RangeSpec {
        RangeSpec::new(&self.data_sheet, &self.data_cells)
    }

    /// Lease register cell
    pub fn control_range(&self) -> RangeSpec {
        RangeSpec::new(&self.control_sheet, &self.control_cell)
    }
}

impl StationSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StationSyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: StationSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.station.client_id.is_empty() {
            return Err(crate::Error::Config("station.client_id cannot be empty".into()));
        }

        if self.store.data_sheet.is_empty() {
            return Err(crate::Error::Config("store.data_sheet cannot be empty".into()));
        }

        if self.lock.renew_interval_ms >= self.lock.ttl_ms {
            return Err(crate::Error::Config(
                "lock.renew_interval_ms must be strictly less than lock.ttl_ms".into(),
            ));
        }

        if self.queue.max_retry == 0 {
            return Err(crate::Error::Config("queue.max_retry must be at least 1".into()));
        }

        Ok(())
    }

    /// Path of the local durable database
    pub fn db_path(&self) -> PathBuf {
        self.station.data_dir.join("stationsync.db")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync.poll_interval_ms)
    }

    pub fn reference_interval(&self) -> Duration {
        Duration::from_millis(self.sync.reference_interval_ms)
    }

    pub fn cache_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.cache.refresh_interval_ms)
    }

    pub fn crash_threshold(&self) -> Duration {
        Duration::from_millis(self.state.crash_threshold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[station]
client_id = "station-7"
data_dir = "/tmp/stationsync"

[store]
data_sheet = "BD"
data_cells = "A:J"
control_sheet = "Control"
control_cell = "A1"

[queue]
max_retry = 5

[lock]
ttl_ms = 20000
renew_interval_ms = 5000
"#;

        let config = StationSyncConfig::from_str(toml).unwrap();
        assert_eq!(config.station.client_id, "station-7");
        assert_eq!(config.queue.max_retry, 5);
        assert_eq!(config.lock.ttl(), Duration::from_millis(20000));
        assert_eq!(config.sync.poll_interval_ms, 30_000);
        assert_eq!(config.store.data_range().to_string(), "BD!A:J");
    }

    #[test]
    fn test_renew_must_be_below_ttl() {
        let toml = r#"
[station]
client_id = "station-7"

[store]

[lock]
ttl_ms = 10000
renew_interval_ms = 10000
"#;

        assert!(StationSyncConfig::from_str(toml).is_err());
    }
}
