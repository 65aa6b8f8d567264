//! Sled-backed persistence: the default durable store
//!
//! One tree per table. Time-series trees (measurements, aggregates) key on
//! `city \0 big-endian-timestamp` so a city's records are contiguous and
//! range scans by time need no filtering pass. Values are JSON. Alert ids
//! come from sled's monotonic id generator.

use super::{StoreAdapter, StoreError};
use crate::types::{Alert, CityConfig, HourlyAggregate, Measurement, Metric};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const MEASUREMENTS_TREE: &str = "measurements";
const AGGREGATES_TREE: &str = "aggregates";
const ALERTS_TREE: &str = "alerts";
const CITIES_TREE: &str = "cities";

/// Embedded sled database implementing the store adapter.
#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
    measurements: sled::Tree,
    aggregates: sled::Tree,
    alerts: sled::Tree,
    cities: sled::Tree,
}

impl SledStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref).map_err(sled_err)?;

        let measurements = db.open_tree(MEASUREMENTS_TREE).map_err(sled_err)?;
        let aggregates = db.open_tree(AGGREGATES_TREE).map_err(sled_err)?;
        let alerts = db.open_tree(ALERTS_TREE).map_err(sled_err)?;
        let cities = db.open_tree(CITIES_TREE).map_err(sled_err)?;

        info!(path = %path_ref.display(), "Sled store opened");

        Ok(Self {
            db: Arc::new(db),
            measurements,
            aggregates,
            alerts,
            cities,
        })
    }

    /// Total stored measurements.
    pub fn measurement_count(&self) -> usize {
        self.measurements.len()
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await.map_err(sled_err)?;
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for SledStore {
    async fn append_measurement(&self, measurement: &Measurement) -> Result<(), StoreError> {
        let key = measurement_key(measurement);
        let value = serde_json::to_vec(measurement).map_err(json_err)?;
        // Measurements ride sled's background flush; only the rarer writes
        // fsync eagerly.
        self.measurements.insert(key, value).map_err(sled_err)?;
        Ok(())
    }

    async fn upsert_hourly_aggregate(&self, aggregate: &HourlyAggregate) -> Result<(), StoreError> {
        let key = aggregate_key(&aggregate.city, aggregate.hour_start);
        let value = serde_json::to_vec(aggregate).map_err(json_err)?;
        let computed_at = aggregate.computed_at;
        // CAS loop: a write older than the stored row keeps the stored bytes,
        // so a replayed parked snapshot cannot regress a fresher flush even
        // when flush and drain race on the same key.
        self.aggregates
            .fetch_and_update(key, |stored| {
                let stored_is_fresher = stored
                    .and_then(|bytes| serde_json::from_slice::<HourlyAggregate>(bytes).ok())
                    .is_some_and(|row| row.computed_at > computed_at);
                if stored_is_fresher {
                    stored.map(<[u8]>::to_vec)
                } else {
                    Some(value.clone())
                }
            })
            .map_err(sled_err)?;
        self.flush().await
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<u64, StoreError> {
        // generate_id can return 0; alert id 0 means "not yet persisted"
        let id = self.db.generate_id().map_err(sled_err)? + 1;

        let mut stored = alert.clone();
        stored.id = id;
        let value = serde_json::to_vec(&stored).map_err(json_err)?;
        self.alerts.insert(id.to_be_bytes(), value).map_err(sled_err)?;
        self.flush().await?;
        Ok(id)
    }

    async fn query_recent_history(
        &self,
        city: &str,
        metric: Metric,
        window: TimeDelta,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, StoreError> {
        let cutoff = Utc::now() - window;

        let mut start = city_prefix(city);
        start.extend_from_slice(&timestamp_nanos(cutoff).to_be_bytes());
        let mut end = city_prefix(city);
        end.extend_from_slice(&i64::MAX.to_be_bytes());

        let mut history = Vec::new();
        for item in self.measurements.range(start..end) {
            let (_key, value) = item.map_err(sled_err)?;
            let measurement: Measurement = match serde_json::from_slice(&value) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable stored measurement");
                    continue;
                }
            };
            // The decoded record's own city field is authoritative; a city
            // name that extends this prefix can graze the scan range.
            if measurement.city != city {
                continue;
            }
            if let Some(value) = measurement.value_of(metric) {
                history.push((measurement.timestamp, value));
            }
        }
        Ok(history)
    }

    async fn get_city_config(&self, city: &str) -> Result<Option<CityConfig>, StoreError> {
        match self.cities.get(city.as_bytes()).map_err(sled_err)? {
            Some(value) => {
                let config = serde_json::from_slice(&value).map_err(json_err)?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    async fn list_city_configs(&self) -> Result<Vec<CityConfig>, StoreError> {
        let mut configs = Vec::new();
        for item in self.cities.iter() {
            let (_key, value) = item.map_err(sled_err)?;
            match serde_json::from_slice::<CityConfig>(&value) {
                Ok(config) => configs.push(config),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable stored city config");
                }
            }
        }
        Ok(configs)
    }

    async fn upsert_city_config(&self, config: &CityConfig) -> Result<(), StoreError> {
        let value = serde_json::to_vec(config).map_err(json_err)?;
        self.cities
            .insert(config.city.as_bytes(), value)
            .map_err(sled_err)?;
        self.flush().await
    }

    async fn acknowledge_alert(&self, id: u64) -> Result<(), StoreError> {
        let key = id.to_be_bytes();
        match self.alerts.get(key).map_err(sled_err)? {
            Some(value) => {
                let mut alert: Alert = serde_json::from_slice(&value).map_err(json_err)?;
                alert.acknowledged = true;
                let updated = serde_json::to_vec(&alert).map_err(json_err)?;
                self.alerts.insert(key, updated).map_err(sled_err)?;
                self.flush().await
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let mut alerts = Vec::new();
        // Keys are big-endian ids, so reverse iteration is newest first
        for item in self.alerts.iter().rev() {
            if alerts.len() >= limit {
                break;
            }
            let (_key, value) = item.map_err(sled_err)?;
            match serde_json::from_slice::<Alert>(&value) {
                Ok(alert) => alerts.push(alert),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable stored alert");
                }
            }
        }
        Ok(alerts)
    }

    async fn recent_aggregates(
        &self,
        city: &str,
        limit: usize,
    ) -> Result<Vec<HourlyAggregate>, StoreError> {
        let prefix = city_prefix(city);
        let mut aggregates = Vec::new();
        for item in self.aggregates.scan_prefix(&prefix).rev() {
            if aggregates.len() >= limit {
                break;
            }
            let (_key, value) = item.map_err(sled_err)?;
            match serde_json::from_slice::<HourlyAggregate>(&value) {
                Ok(aggregate) if aggregate.city == city => aggregates.push(aggregate),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable stored aggregate");
                }
            }
        }
        Ok(aggregates)
    }

    async fn latest_measurement(&self, city: &str) -> Result<Option<Measurement>, StoreError> {
        let prefix = city_prefix(city);
        for item in self.measurements.scan_prefix(&prefix).rev() {
            let (_key, value) = item.map_err(sled_err)?;
            match serde_json::from_slice::<Measurement>(&value) {
                Ok(measurement) if measurement.city == city => return Ok(Some(measurement)),
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable stored measurement");
                }
            }
        }
        Ok(None)
    }

    fn backend_name(&self) -> &'static str {
        "Sled"
    }
}

fn sled_err(e: sled::Error) -> StoreError {
    match e {
        sled::Error::Io(io) => StoreError::Unavailable(io.to_string()),
        other => StoreError::Storage(other.to_string()),
    }
}

fn json_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn timestamp_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp().saturating_mul(1_000_000_000))
}

fn city_prefix(city: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(city.len() + 1);
    prefix.extend_from_slice(city.as_bytes());
    prefix.push(0);
    prefix
}

fn measurement_key(measurement: &Measurement) -> Vec<u8> {
    let mut key = city_prefix(&measurement.city);
    key.extend_from_slice(&timestamp_nanos(measurement.timestamp).to_be_bytes());
    key.push(0);
    key.extend_from_slice(measurement.source.as_bytes());
    key
}

fn aggregate_key(city: &str, hour_start: DateTime<Utc>) -> Vec<u8> {
    let mut key = city_prefix(city);
    key.extend_from_slice(&hour_start.timestamp().to_be_bytes());
    key
}
