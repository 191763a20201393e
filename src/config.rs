//! Configuration for storage, live streaming and delivery
//!
//! Every tunable has a default matching the behavior described in the crate
//! docs, so `LiveConfig::default()` is a working configuration. Values can
//! be loaded from YAML and overridden from the environment:
//!
//! ```yaml
//! data_dir: ./runs
//! store:
//!   backend: archive
//!   archive_threshold_bytes: 1048576
//! delivery:
//!   max_items: 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::BackendKind;

/// Environment variable overriding [`LiveConfig::data_dir`]
pub const DATA_DIR_ENV: &str = "ENTRENAR_DATA_DIR";

/// Environment variable overriding [`StoreConfig::backend`]
pub const BACKEND_ENV: &str = "ENTRENAR_STORE_BACKEND";

const MIB: u64 = 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Root directory holding every project
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("entrenar-data")
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
            stream: StreamConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl LiveConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Apply `ENTRENAR_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(backend) = std::env::var(BACKEND_ENV) {
            self.store.backend = backend.parse()?;
        }
        Ok(self)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.store.backend = backend;
        self
    }

    pub fn with_archive_threshold(mut self, bytes: u64) -> Self {
        self.store.archive_threshold_bytes = bytes;
        self
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.store.archive_threshold_bytes == 0 {
            return Err(Error::Config("store.archive_threshold_bytes must be > 0".into()));
        }
        if self.stream.tail_bytes == 0 || self.stream.tail_bytes > self.stream.tail_threshold_bytes {
            return Err(Error::Config(
                "stream.tail_bytes must be > 0 and <= stream.tail_threshold_bytes".into(),
            ));
        }
        if self.delivery.max_items == 0 || self.delivery.max_bytes == 0 {
            return Err(Error::Config("delivery queue bounds must be > 0".into()));
        }
        if self.delivery.poll_interval_ms == 0 {
            return Err(Error::Config("delivery.poll_interval_ms must be > 0".into()));
        }
        self.delivery.backoff.validate()
    }
}

/// Metric store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend used for newly created runs
    pub backend: BackendKind,
    /// WAL size that triggers compaction on the next save
    pub archive_threshold_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Jsonl,
            archive_threshold_bytes: 10 * MIB,
        }
    }
}

/// Live subscription settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Files larger than this are caught up from their tail only
    pub tail_threshold_bytes: u64,
    /// Bytes read from the end of a large file during catch-up
    pub tail_bytes: u64,
    /// Window used to coalesce change notifications into one batch
    pub batch_window_ms: u64,
    /// Upper bound on waiting for the dispatch loop to exit
    pub stop_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tail_threshold_bytes: 5 * MIB,
            tail_bytes: MIB,
            batch_window_ms: 50,
            stop_timeout_ms: 2_000,
        }
    }
}

impl StreamConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Offline delivery queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Maximum pending items per run
    pub max_items: usize,
    /// Maximum queue file size per run
    pub max_bytes: u64,
    /// Fraction of `max_items` dropped at once when a bound is exceeded
    pub drop_fraction: f64,
    /// Worker sleep between passes
    pub poll_interval_ms: u64,
    /// How long a health check result is trusted
    pub health_ttl_secs: u64,
    /// Maximum items attempted per worker pass
    pub batch_size: usize,
    /// Default deadline for a graceful flush
    pub flush_timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            max_bytes: 50 * MIB,
            drop_fraction: 0.1,
            poll_interval_ms: 1_000,
            health_ttl_secs: 30,
            batch_size: 100,
            flush_timeout_secs: 30,
            backoff: BackoffConfig::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    /// Number of oldest items dropped when the queue overflows
    pub fn drop_batch(&self) -> usize {
        ((self.max_items as f64 * self.drop_fraction).ceil() as usize).max(1)
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: f64,
    pub max_secs: f64,
    /// Relative jitter applied in both directions (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 1.0,
            max_secs: 300.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<()> {
        if !(self.base_secs > 0.0 && self.max_secs >= self.base_secs) {
            return Err(Error::Config("backoff requires 0 < base_secs <= max_secs".into()));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Config("backoff.jitter must be in [0, 1)".into()));
        }
        Ok(())
    }
}
