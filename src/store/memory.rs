//! In-memory store for tests and minimal deployments
//!
//! Thread-safe via `RwLock`. Not durable; data is lost on restart. Bounded:
//! oldest measurements and alerts are evicted past the caps.

use super::{StoreAdapter, StoreError};
use crate::types::{Alert, CityConfig, HourlyAggregate, Measurement, Metric};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

const MAX_MEASUREMENTS: usize = 50_000;
const MAX_ALERTS: usize = 10_000;

/// In-memory persistence backend.
pub struct MemoryStore {
    measurements: RwLock<Vec<Measurement>>,
    aggregates: RwLock<HashMap<(String, DateTime<Utc>), HourlyAggregate>>,
    alerts: RwLock<Vec<Alert>>,
    cities: RwLock<HashMap<String, CityConfig>>,
    next_alert_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            measurements: RwLock::new(Vec::new()),
            aggregates: RwLock::new(HashMap::new()),
            alerts: RwLock::new(Vec::new()),
            cities: RwLock::new(HashMap::new()),
            next_alert_id: AtomicU64::new(0),
        }
    }

    /// Total stored measurements (test helper).
    pub fn measurement_count(&self) -> usize {
        self.measurements
            .read()
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn append_measurement(&self, measurement: &Measurement) -> Result<(), StoreError> {
        let mut store = self
            .measurements
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        store.push(measurement.clone());

        // Evict oldest if over limit
        if store.len() > MAX_MEASUREMENTS {
            store.remove(0);
        }

        Ok(())
    }

    async fn upsert_hourly_aggregate(&self, aggregate: &HourlyAggregate) -> Result<(), StoreError> {
        let mut store = self
            .aggregates
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let key = (aggregate.city.clone(), aggregate.hour_start);
        // A write older than the stored row is dropped; replayed parked
        // snapshots must not regress a fresher flush.
        if store
            .get(&key)
            .is_some_and(|stored| stored.computed_at > aggregate.computed_at)
        {
            return Ok(());
        }
        store.insert(key, aggregate.clone());
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<u64, StoreError> {
        let id = self.next_alert_id.fetch_add(1, Ordering::SeqCst) + 1;

        let mut store = self
            .alerts
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let mut stored = alert.clone();
        stored.id = id;
        store.push(stored);

        if store.len() > MAX_ALERTS {
            store.remove(0);
        }

        Ok(id)
    }

    async fn query_recent_history(
        &self,
        city: &str,
        metric: Metric,
        window: TimeDelta,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, StoreError> {
        let store = self
            .measurements
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let cutoff = Utc::now() - window;
        let mut history: Vec<(DateTime<Utc>, f64)> = store
            .iter()
            .filter(|m| m.city == city && m.timestamp >= cutoff)
            .filter_map(|m| m.value_of(metric).map(|v| (m.timestamp, v)))
            .collect();
        history.sort_by_key(|(ts, _)| *ts);
        Ok(history)
    }

    async fn get_city_config(&self, city: &str) -> Result<Option<CityConfig>, StoreError> {
        let store = self
            .cities
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(store.get(city).cloned())
    }

    async fn list_city_configs(&self) -> Result<Vec<CityConfig>, StoreError> {
        let store = self
            .cities
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let mut configs: Vec<CityConfig> = store.values().cloned().collect();
        configs.sort_by(|a, b| a.city.cmp(&b.city));
        Ok(configs)
    }

    async fn upsert_city_config(&self, config: &CityConfig) -> Result<(), StoreError> {
        let mut store = self
            .cities
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        store.insert(config.city.clone(), config.clone());
        Ok(())
    }

    async fn acknowledge_alert(&self, id: u64) -> Result<(), StoreError> {
        let mut store = self
            .alerts
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        match store.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let store = self
            .alerts
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(store.iter().rev().take(limit).cloned().collect())
    }

    async fn recent_aggregates(
        &self,
        city: &str,
        limit: usize,
    ) -> Result<Vec<HourlyAggregate>, StoreError> {
        let store = self
            .aggregates
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let mut aggregates: Vec<HourlyAggregate> = store
            .values()
            .filter(|a| a.city == city)
            .cloned()
            .collect();
        aggregates.sort_by_key(|a| std::cmp::Reverse(a.hour_start));
        aggregates.truncate(limit);
        Ok(aggregates)
    }

    async fn latest_measurement(&self, city: &str) -> Result<Option<Measurement>, StoreError> {
        let store = self
            .measurements
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(store
            .iter()
            .filter(|m| m.city == city)
            .max_by_key(|m| m.timestamp)
            .cloned())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertType, AqiCategory, Severity, WeatherSample};
    use chrono::TimeZone;

    fn make_measurement(city: &str, minute: u32) -> Measurement {
        Measurement {
            city: city.to_string(),
            country: "XX".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            timestamp: Utc::now() - TimeDelta::minutes(i64::from(minute)),
            source: "test".to_string(),
            pm25: Some(20.0),
            pm10: None,
            co: None,
            no2: None,
            o3: None,
            so2: None,
            aqi: 68,
            aqi_category: AqiCategory::Moderate,
            weather: WeatherSample::default(),
            ingested_at: Utc::now(),
        }
    }

    fn make_alert(city: &str) -> Alert {
        Alert {
            id: 0,
            city: city.to_string(),
            alert_type: AlertType::ThresholdBreach,
            severity: Severity::Warning,
            metric: "pm25".to_string(),
            value: 40.0,
            threshold: 35.0,
            message: "test".to_string(),
            timestamp: Utc::now(),
            acknowledged: false,
        }
    }

    fn make_aggregate(city: &str, hour: u32) -> HourlyAggregate {
        HourlyAggregate {
            city: city.to_string(),
            hour_start: Utc.with_ymd_and_hms(2024, 3, 15, hour, 0, 0).unwrap(),
            avg_pm25: Some(20.0),
            avg_pm10: None,
            avg_co: None,
            avg_no2: None,
            avg_o3: None,
            avg_so2: None,
            avg_aqi: 68.0,
            max_aqi: 70,
            min_aqi: 65,
            measurement_count: 4,
            computed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_latest() {
        let store = MemoryStore::new();
        store.append_measurement(&make_measurement("London", 10)).await.unwrap();
        store.append_measurement(&make_measurement("London", 0)).await.unwrap();
        store.append_measurement(&make_measurement("Paris", 5)).await.unwrap();

        let latest = store.latest_measurement("London").await.unwrap().unwrap();
        assert!(latest.timestamp > Utc::now() - TimeDelta::minutes(1));
        assert!(store.latest_measurement("Oslo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_aggregate_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let aggregate = make_aggregate("London", 10);

        store.upsert_hourly_aggregate(&aggregate).await.unwrap();
        store.upsert_hourly_aggregate(&aggregate).await.unwrap();

        let recent = store.recent_aggregates("London", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].measurement_count, 4);
    }

    #[tokio::test]
    async fn test_stale_upsert_keeps_fresher_row() {
        let store = MemoryStore::new();
        let mut fresh = make_aggregate("London", 10);
        fresh.measurement_count = 9;
        store.upsert_hourly_aggregate(&fresh).await.unwrap();

        let mut stale = make_aggregate("London", 10);
        stale.measurement_count = 4;
        stale.computed_at = fresh.computed_at - TimeDelta::minutes(5);
        store.upsert_hourly_aggregate(&stale).await.unwrap();

        let recent = store.recent_aggregates("London", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].measurement_count, 9);
    }

    #[tokio::test]
    async fn test_alert_ids_and_acknowledge() {
        let store = MemoryStore::new();
        let first = store.insert_alert(&make_alert("London")).await.unwrap();
        let second = store.insert_alert(&make_alert("Paris")).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        store.acknowledge_alert(first).await.unwrap();
        let alerts = store.recent_alerts(10).await.unwrap();
        // newest first
        assert_eq!(alerts[0].city, "Paris");
        assert!(!alerts[0].acknowledged);
        assert!(alerts[1].acknowledged);

        assert!(matches!(
            store.acknowledge_alert(999).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_history_filters_city_metric_and_window() {
        let store = MemoryStore::new();
        store.append_measurement(&make_measurement("London", 5)).await.unwrap();
        store.append_measurement(&make_measurement("London", 90)).await.unwrap();
        store.append_measurement(&make_measurement("Paris", 5)).await.unwrap();

        let history = store
            .query_recent_history("London", Metric::Pm25, TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].1, 20.0);

        // so2 never present on these measurements
        let empty = store
            .query_recent_history("London", Metric::So2, TimeDelta::hours(24))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_city_config_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get_city_config("London").await.unwrap().is_none());

        for config in crate::config::seeded_cities() {
            store.upsert_city_config(&config).await.unwrap();
        }

        let config = store.get_city_config("London").await.unwrap().unwrap();
        assert_eq!(config.country, "GB");
        assert_eq!(store.list_city_configs().await.unwrap().len(), 8);
    }
}
