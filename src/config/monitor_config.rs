//! Monitor Configuration - pipeline tuning as operator-editable TOML values
//!
//! Every tunable the pipeline consults is a field here. Each struct
//! implements `Default` from the constants in [`super::defaults`], so an
//! absent config file means stock behavior.

use super::defaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a monitor deployment.
///
/// Load with `MonitorConfig::load()` which searches:
/// 1. `$AIRWARDEN_CONFIG` env var
/// 2. `./monitor_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Deduplicating ingest buffer
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Hourly aggregation windows
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Anomaly detection baselines
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Store write retry policy
    #[serde(default)]
    pub store: StoreConfig,

    /// City registry refresh
    #[serde(default)]
    pub registry: RegistryConfig,

    /// HTTP server
    #[serde(default)]
    pub server: ServerConfig,
}

impl MonitorConfig {
    /// Load configuration using the standard search order:
    /// 1. `$AIRWARDEN_CONFIG` environment variable
    /// 2. `./monitor_config.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("AIRWARDEN_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded monitor config from AIRWARDEN_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from AIRWARDEN_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "AIRWARDEN_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("monitor_config.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded monitor config from ./monitor_config.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./monitor_config.toml, using defaults");
                }
            }
        }

        info!("No monitor_config.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for internal consistency.
    ///
    /// Rules:
    /// - Sigma bands must be strictly increasing and positive
    /// - Windows, capacities, and sample minimums must be non-zero
    /// - Retry policy must allow at least one attempt
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let d = &self.detection;
        if d.sigma_warning <= 0.0 {
            errors.push(format!(
                "detection.sigma_warning ({}) must be positive",
                d.sigma_warning
            ));
        }
        if !(d.sigma_warning < d.sigma_alert && d.sigma_alert < d.sigma_critical) {
            errors.push(format!(
                "detection sigma bands must be strictly increasing (warning {} / alert {} / critical {})",
                d.sigma_warning, d.sigma_alert, d.sigma_critical
            ));
        }
        if d.min_baseline_samples == 0 {
            errors.push("detection.min_baseline_samples must be > 0".to_string());
        }
        if d.baseline_window_hours <= 0 {
            errors.push("detection.baseline_window_hours must be > 0".to_string());
        }
        if d.baseline_refresh_secs == 0 {
            errors.push("detection.baseline_refresh_secs must be > 0".to_string());
        }

        if self.ingest.dedup_window_hours <= 0 {
            errors.push("ingest.dedup_window_hours must be > 0".to_string());
        }
        if self.ingest.shard_count == 0 {
            errors.push("ingest.shard_count must be > 0".to_string());
        }
        if self.ingest.channel_capacity == 0 {
            errors.push("ingest.channel_capacity must be > 0".to_string());
        }

        if self.aggregation.grace_period_secs < 0 {
            errors.push("aggregation.grace_period_secs must be >= 0".to_string());
        }
        if self.aggregation.max_open_windows == 0 {
            errors.push("aggregation.max_open_windows must be > 0".to_string());
        }

        if self.store.retry_max_attempts == 0 {
            errors.push("store.retry_max_attempts must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Deduplicating ingest buffer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    /// Identity keys seen within this many hours are remembered
    #[serde(default = "default_dedup_window_hours")]
    pub dedup_window_hours: i64,

    /// Lock shards in the seen-set
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Interval between eviction sweeps (seconds)
    #[serde(default = "default_eviction_sweep_secs")]
    pub eviction_sweep_secs: u64,

    /// Bounded channel capacity to the aggregator/detector tasks
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_dedup_window_hours() -> i64 {
    defaults::DEDUP_WINDOW_HOURS
}
fn default_shard_count() -> usize {
    defaults::DEDUP_SHARD_COUNT
}
fn default_eviction_sweep_secs() -> u64 {
    defaults::DEDUP_EVICTION_SWEEP_SECS
}
fn default_channel_capacity() -> usize {
    defaults::INGEST_CHANNEL_CAPACITY
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_window_hours: default_dedup_window_hours(),
            shard_count: default_shard_count(),
            eviction_sweep_secs: default_eviction_sweep_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Hourly aggregation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationConfig {
    /// Seconds past the hour end before a window becomes flush-eligible
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: i64,

    /// Interval between flush sweeps (seconds)
    #[serde(default = "default_flush_sweep_secs")]
    pub flush_sweep_secs: u64,

    /// Cap on simultaneously open windows
    #[serde(default = "default_max_open_windows")]
    pub max_open_windows: usize,
}

fn default_grace_period_secs() -> i64 {
    defaults::AGGREGATE_GRACE_PERIOD_SECS
}
fn default_flush_sweep_secs() -> u64 {
    defaults::FLUSH_SWEEP_INTERVAL_SECS
}
fn default_max_open_windows() -> usize {
    defaults::MAX_OPEN_WINDOWS
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            flush_sweep_secs: default_flush_sweep_secs(),
            max_open_windows: default_max_open_windows(),
        }
    }
}

/// Anomaly detection tuning. The sigma bands map deviation magnitude to
/// severity and must increase monotonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    /// Deviation (σ) at which an anomaly candidate first fires
    #[serde(default = "default_sigma_warning")]
    pub sigma_warning: f64,

    /// Deviation (σ) for alert severity
    #[serde(default = "default_sigma_alert")]
    pub sigma_alert: f64,

    /// Deviation (σ) for critical severity
    #[serde(default = "default_sigma_critical")]
    pub sigma_critical: f64,

    /// Minimum samples before a baseline is trusted
    #[serde(default = "default_min_baseline_samples")]
    pub min_baseline_samples: u64,

    /// History window used to seed baselines from the store (hours)
    #[serde(default = "default_baseline_window_hours")]
    pub baseline_window_hours: i64,

    /// How often baselines reset and re-seed from the trailing window (seconds)
    #[serde(default = "default_baseline_refresh_secs")]
    pub baseline_refresh_secs: u64,
}

fn default_sigma_warning() -> f64 {
    defaults::SIGMA_WARNING
}
fn default_sigma_alert() -> f64 {
    defaults::SIGMA_ALERT
}
fn default_sigma_critical() -> f64 {
    defaults::SIGMA_CRITICAL
}
fn default_min_baseline_samples() -> u64 {
    defaults::MIN_BASELINE_SAMPLES
}
fn default_baseline_window_hours() -> i64 {
    defaults::BASELINE_WINDOW_HOURS
}
fn default_baseline_refresh_secs() -> u64 {
    defaults::BASELINE_REFRESH_SECS
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sigma_warning: default_sigma_warning(),
            sigma_alert: default_sigma_alert(),
            sigma_critical: default_sigma_critical(),
            min_baseline_samples: default_min_baseline_samples(),
            baseline_window_hours: default_baseline_window_hours(),
            baseline_refresh_secs: default_baseline_refresh_secs(),
        }
    }
}

/// Store write retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Data directory for the sled backend
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// First retry delay (milliseconds)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Attempts before a write parks in the retry queue
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Cap on a single backoff delay (seconds)
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    /// Retry queue capacity
    #[serde(default = "default_retry_queue_capacity")]
    pub retry_queue_capacity: usize,

    /// Interval between retry-queue drain passes (seconds)
    #[serde(default = "default_retry_drain_secs")]
    pub retry_drain_secs: u64,
}

fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_retry_base_delay_ms() -> u64 {
    defaults::STORE_RETRY_BASE_DELAY_MS
}
fn default_retry_max_attempts() -> u32 {
    defaults::STORE_RETRY_MAX_ATTEMPTS
}
fn default_retry_max_delay_secs() -> u64 {
    defaults::STORE_RETRY_MAX_DELAY_SECS
}
fn default_retry_queue_capacity() -> usize {
    defaults::RETRY_QUEUE_CAPACITY
}
fn default_retry_drain_secs() -> u64 {
    defaults::RETRY_DRAIN_INTERVAL_SECS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            retry_queue_capacity: default_retry_queue_capacity(),
            retry_drain_secs: default_retry_drain_secs(),
        }
    }
}

/// City registry refresh cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Snapshot refresh interval (seconds)
    #[serde(default = "default_registry_refresh_secs")]
    pub refresh_secs: u64,
}

fn default_registry_refresh_secs() -> u64 {
    defaults::REGISTRY_REFRESH_SECS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_registry_refresh_secs(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_addr() -> String {
    defaults::DEFAULT_SERVER_ADDR.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Configuration loading/validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
