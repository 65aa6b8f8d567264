//! System-wide default constants.
//!
//! Centralises the pipeline's magic numbers. Grouped by subsystem for easy
//! discovery; the TOML config overrides any of these at deployment time.

// ============================================================================
// Ingest Buffer
// ============================================================================

/// Dedup window: identity keys older than this are evicted (hours).
pub const DEDUP_WINDOW_HOURS: i64 = 48;

/// Number of lock shards in the dedup seen-set.
///
/// Keys hash to one of these; 16 keeps contention negligible at the
/// producer counts this core targets while staying cheap to sweep.
pub const DEDUP_SHARD_COUNT: usize = 16;

/// Interval between dedup-eviction sweeps (seconds).
pub const DEDUP_EVICTION_SWEEP_SECS: u64 = 300;

/// Capacity of the accepted-measurement channels feeding the aggregator
/// and detector tasks. A full channel applies backpressure to ingest.
pub const INGEST_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Hourly Aggregation
// ============================================================================

/// Extra time after an hour boundary during which a window is held open
/// for late data before its first flush (seconds). 600 = 10 minutes.
pub const AGGREGATE_GRACE_PERIOD_SECS: i64 = 600;

/// Interval between flush-eligibility sweeps (seconds).
pub const FLUSH_SWEEP_INTERVAL_SECS: u64 = 60;

/// Cap on simultaneously open windows; the sweep force-flushes the oldest
/// beyond this to bound memory against abandoned windows.
pub const MAX_OPEN_WINDOWS: usize = 1_000;

// ============================================================================
// Anomaly Detection
// ============================================================================

/// Deviation (in standard deviations) at which a warning anomaly fires.
pub const SIGMA_WARNING: f64 = 3.0;

/// Deviation at which an anomaly escalates to alert severity.
pub const SIGMA_ALERT: f64 = 4.0;

/// Deviation at which an anomaly escalates to critical severity.
pub const SIGMA_CRITICAL: f64 = 6.0;

/// Minimum baseline samples before anomaly checks run for a metric.
pub const MIN_BASELINE_SAMPLES: u64 = 10;

/// How much history seeds a baseline on first sight of a (city, metric)
/// pair (hours).
pub const BASELINE_WINDOW_HOURS: i64 = 48;

/// Interval between baseline resets (seconds). Each reset drops the
/// accumulated statistics so they re-seed from the trailing history
/// window, keeping baselines rolling instead of growing forever.
pub const BASELINE_REFRESH_SECS: u64 = 3_600;

// ============================================================================
// Default Threshold Bands
// ============================================================================
//
// Applied to unknown cities and used as registry seeds. Units match the
// raw concentrations: µg/m³ (PM), ppb (NO2/O3), ppm (CO), index (AQI).

pub const PM25_WARNING: f64 = 35.0;
pub const PM25_ALERT: f64 = 55.0;
pub const PM25_CRITICAL: f64 = 150.0;

pub const PM10_WARNING: f64 = 54.0;
pub const PM10_ALERT: f64 = 154.0;
pub const PM10_CRITICAL: f64 = 354.0;

pub const AQI_WARNING: f64 = 100.0;
pub const AQI_ALERT: f64 = 150.0;
pub const AQI_CRITICAL: f64 = 200.0;

pub const NO2_WARNING: f64 = 100.0;
pub const NO2_ALERT: f64 = 200.0;
pub const NO2_CRITICAL: f64 = 400.0;

pub const O3_WARNING: f64 = 70.0;
pub const O3_ALERT: f64 = 105.0;
pub const O3_CRITICAL: f64 = 200.0;

pub const CO_WARNING: f64 = 9.0;
pub const CO_ALERT: f64 = 15.0;
pub const CO_CRITICAL: f64 = 30.0;

// ============================================================================
// Store Retry
// ============================================================================

/// First retry delay for a failed store write (milliseconds).
pub const STORE_RETRY_BASE_DELAY_MS: u64 = 500;

/// Maximum retry attempts before a write is handed to the retry queue.
pub const STORE_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Cap on any single backoff delay (seconds).
pub const STORE_RETRY_MAX_DELAY_SECS: u64 = 30;

/// Maximum writes parked in the retry queue; oldest dropped beyond this.
pub const RETRY_QUEUE_CAPACITY: usize = 1_000;

/// Interval between retry-queue drain passes (seconds).
pub const RETRY_DRAIN_INTERVAL_SECS: u64 = 60;

// ============================================================================
// City Registry
// ============================================================================

/// How often the registry snapshot refreshes from the store (seconds).
pub const REGISTRY_REFRESH_SECS: u64 = 300;

// ============================================================================
// HTTP Server
// ============================================================================

/// Default bind address for the operational API.
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8080";

// ============================================================================
// Simulation
// ============================================================================

/// Base inter-reading delay for the synthetic source at `--speed 1` (ms).
pub const SIMULATION_BASE_DELAY_MS: u64 = 1_000;
