//! Store adapter: the persistence boundary
//!
//! The pipeline is the sole writer of durable state and always goes through
//! [`StoreAdapter`], so backends can be swapped without touching pipeline
//! code:
//! - `MemoryStore`: in-memory store for tests and minimal deployments
//! - `SledStore`: embedded sled database, the default backend
//!
//! Transient write failures are retried with bounded exponential backoff and
//! then parked in the [`retry::RetryQueue`] for a later drain pass.

pub mod memory;
pub mod retry;
pub mod sled_store;

pub use memory::MemoryStore;
pub use retry::{drain_once, retry_with_backoff, run_retry_drain, PendingWrite, RetryPolicy, RetryQueue};
pub use sled_store::SledStore;

use crate::types::{Alert, CityConfig, HourlyAggregate, Measurement, Metric};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transient backend failure; the write is worth retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Permanent backend failure (corruption, misuse).
    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found")]
    NotFound,
}

impl StoreError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Trait for pluggable persistence backends.
///
/// Implementations must be thread-safe (`Send + Sync`) for shared access
/// across async tasks. The hourly-aggregate upsert must be keyed on
/// (city, hour start) so concurrent flush attempts for the same window
/// converge on one row.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Append one accepted measurement. Measurements are immutable and
    /// retained indefinitely.
    async fn append_measurement(&self, measurement: &Measurement) -> Result<(), StoreError>;

    /// Insert or overwrite the aggregate row for its (city, hour start)
    /// identity. Rows are versioned by `computed_at`: a write older than the
    /// stored row is dropped, so a replayed retry-queue snapshot cannot
    /// regress a newer flush. Idempotent: re-upserting the same aggregate is
    /// a no-op.
    async fn upsert_hourly_aggregate(&self, aggregate: &HourlyAggregate) -> Result<(), StoreError>;

    /// Persist an alert, returning its assigned sequence id.
    async fn insert_alert(&self, alert: &Alert) -> Result<u64, StoreError>;

    /// Historical (timestamp, value) pairs for one (city, metric) within the
    /// trailing window, oldest first. Used to seed anomaly baselines.
    async fn query_recent_history(
        &self,
        city: &str,
        metric: Metric,
        window: TimeDelta,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, StoreError>;

    async fn get_city_config(&self, city: &str) -> Result<Option<CityConfig>, StoreError>;

    /// All city configurations, for registry refresh.
    async fn list_city_configs(&self) -> Result<Vec<CityConfig>, StoreError>;

    /// Insert or replace a city configuration (provisioning and
    /// auto-registration).
    async fn upsert_city_config(&self, config: &CityConfig) -> Result<(), StoreError>;

    /// Mark an alert acknowledged. `NotFound` if the id is unknown.
    async fn acknowledge_alert(&self, id: u64) -> Result<(), StoreError>;

    /// Most recent alerts, newest first.
    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError>;

    /// Most recent hourly aggregates for a city, newest first.
    async fn recent_aggregates(
        &self,
        city: &str,
        limit: usize,
    ) -> Result<Vec<HourlyAggregate>, StoreError>;

    /// The newest measurement for a city, if any.
    async fn latest_measurement(&self, city: &str) -> Result<Option<Measurement>, StoreError>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}
