//! Hourly aggregation: online per-(city, hour) accumulators
//!
//! The aggregator task owns the whole window map, so per-window updates are
//! single-writer by construction: accumulate and sweep interleave inside one
//! `select!` loop and every flush sees a consistent snapshot. Windows flush
//! once wall clock passes hour end plus the grace period; late data re-dirties
//! a flushed window and the next sweep upserts the refreshed row over the old
//! one. Accumulators hold running sums only, never the raw measurements.

use crate::config::AggregationConfig;
use crate::store::{retry_with_backoff, PendingWrite, RetryPolicy, RetryQueue, StoreAdapter};
use crate::types::{HourlyAggregate, Measurement, Metric, WindowKey};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Window Accumulator
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct PollutantSum {
    sum: f64,
    count: u64,
}

/// Running statistics for one (city, hour) window.
///
/// Snapshots are deterministic: with no new data between two calls,
/// `snapshot()` returns identical rows, which is what makes re-flushing a
/// quiet window a no-op upsert.
#[derive(Debug)]
pub struct WindowAccumulator {
    key: WindowKey,
    pollutant_sums: BTreeMap<Metric, PollutantSum>,
    aqi_sum: f64,
    aqi_min: u16,
    aqi_max: u16,
    count: u64,
    late_count: u64,
    last_changed: DateTime<Utc>,
    dirty: bool,
}

impl WindowAccumulator {
    pub fn new(key: WindowKey) -> Self {
        Self {
            key,
            pollutant_sums: BTreeMap::new(),
            aqi_sum: 0.0,
            aqi_min: u16::MAX,
            aqi_max: 0,
            count: 0,
            late_count: 0,
            last_changed: Utc::now(),
            dirty: false,
        }
    }

    /// Fold one measurement into the running sums.
    pub fn accumulate(&mut self, measurement: &Measurement, late: bool) {
        for metric in Metric::POLLUTANTS {
            if let Some(value) = measurement.value_of(metric) {
                let slot = self.pollutant_sums.entry(metric).or_default();
                slot.sum += value;
                slot.count += 1;
            }
        }
        self.aqi_sum += f64::from(measurement.aqi);
        self.aqi_min = self.aqi_min.min(measurement.aqi);
        self.aqi_max = self.aqi_max.max(measurement.aqi);
        self.count += 1;
        if late {
            self.late_count += 1;
        }
        self.last_changed = Utc::now();
        self.dirty = true;
    }

    /// Current aggregate row for this window.
    pub fn snapshot(&self) -> HourlyAggregate {
        let avg = |metric: Metric| {
            self.pollutant_sums
                .get(&metric)
                .filter(|s| s.count > 0)
                .map(|s| s.sum / s.count as f64)
        };

        HourlyAggregate {
            city: self.key.city.clone(),
            hour_start: self.key.hour_start,
            avg_pm25: avg(Metric::Pm25),
            avg_pm10: avg(Metric::Pm10),
            avg_co: avg(Metric::Co),
            avg_no2: avg(Metric::No2),
            avg_o3: avg(Metric::O3),
            avg_so2: avg(Metric::So2),
            avg_aqi: if self.count > 0 {
                self.aqi_sum / self.count as f64
            } else {
                0.0
            },
            max_aqi: self.aqi_max,
            min_aqi: if self.count > 0 { self.aqi_min } else { 0 },
            measurement_count: self.count,
            computed_at: self.last_changed,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn late_count(&self) -> u64 {
        self.late_count
    }

    fn mark_flushed(&mut self) {
        self.dirty = false;
    }
}

// ============================================================================
// Hourly Aggregator
// ============================================================================

/// Owner of all open aggregation windows. Driven by [`run_aggregator`].
pub struct HourlyAggregator {
    windows: HashMap<WindowKey, WindowAccumulator>,
    store: Arc<dyn StoreAdapter>,
    retry_queue: Arc<RetryQueue>,
    retry_policy: RetryPolicy,
    grace: TimeDelta,
    max_open_windows: usize,
    /// Flushed rows are forwarded here for aggregate-level detection.
    flush_tx: Option<mpsc::Sender<HourlyAggregate>>,
    flushed_total: u64,
}

impl HourlyAggregator {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        retry_queue: Arc<RetryQueue>,
        retry_policy: RetryPolicy,
        config: &AggregationConfig,
        flush_tx: Option<mpsc::Sender<HourlyAggregate>>,
    ) -> Self {
        Self {
            windows: HashMap::new(),
            store,
            retry_queue,
            retry_policy,
            grace: TimeDelta::seconds(config.grace_period_secs.max(0)),
            max_open_windows: config.max_open_windows.max(1),
            flush_tx,
            flushed_total: 0,
        }
    }

    /// Fold a measurement into its (city, hour) window, opening the window on
    /// first sight. Arrivals past the grace period still accumulate but are
    /// flagged late; the refreshed row lands on the next sweep.
    pub fn accumulate(&mut self, measurement: &Measurement) {
        let key = WindowKey::for_timestamp(&measurement.city, measurement.timestamp);
        let late = Utc::now() > key.hour_end() + self.grace;
        if late {
            warn!(
                window = %key,
                source = %measurement.source,
                "Late measurement past grace period, window will re-flush"
            );
        }

        self.windows
            .entry(key.clone())
            .or_insert_with(|| WindowAccumulator::new(key))
            .accumulate(measurement, late);
    }

    /// Flush every dirty window whose grace period has passed, then enforce
    /// the open-window cap.
    pub async fn sweep(&mut self) {
        let now = Utc::now();
        let eligible: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(key, window)| window.is_dirty() && now > key.hour_end() + self.grace)
            .map(|(key, _)| key.clone())
            .collect();

        for key in eligible {
            self.flush_window(&key).await;
        }
        self.enforce_window_cap().await;
    }

    /// Flush every dirty window regardless of eligibility (shutdown path).
    pub async fn flush_all(&mut self) {
        let dirty: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(_, window)| window.is_dirty())
            .map(|(key, _)| key.clone())
            .collect();

        let count = dirty.len();
        for key in dirty {
            self.flush_window(&key).await;
        }
        if count > 0 {
            info!(windows = count, "Flushed all dirty aggregation windows");
        }
    }

    /// Upsert one window's snapshot. On success the window is marked clean
    /// and any stale parked snapshot for the same identity is discarded; on
    /// exhausted retries the snapshot parks in the retry queue and the window
    /// stays dirty so a later sweep flushes fresh state.
    async fn flush_window(&mut self, key: &WindowKey) {
        let snapshot = match self.windows.get(key) {
            Some(window) => window.snapshot(),
            None => return,
        };

        let store = Arc::clone(&self.store);
        let result = retry_with_backoff(&self.retry_policy, "upsert_hourly_aggregate", || {
            store.upsert_hourly_aggregate(&snapshot)
        })
        .await;

        match result {
            Ok(()) => {
                self.retry_queue.discard_aggregate(&key.city, key.hour_start);
                if let Some(window) = self.windows.get_mut(key) {
                    window.mark_flushed();
                }
                self.flushed_total += 1;
                debug!(
                    window = %key,
                    count = snapshot.measurement_count,
                    avg_aqi = snapshot.avg_aqi,
                    "Flushed hourly aggregate"
                );
                if let Some(tx) = &self.flush_tx {
                    if tx.send(snapshot).await.is_err() {
                        debug!("Aggregate evaluation channel closed, skipping forward");
                    }
                }
            }
            Err(e) => {
                warn!(window = %key, error = %e, "Aggregate flush failed, parking snapshot for retry pass");
                self.retry_queue.push(PendingWrite::Aggregate(snapshot));
            }
        }
    }

    /// Evict oldest windows beyond the cap, flushing dirty ones first so no
    /// accumulated data is dropped silently.
    async fn enforce_window_cap(&mut self) {
        while self.windows.len() > self.max_open_windows {
            let oldest = self
                .windows
                .keys()
                .min_by_key(|key| key.hour_start)
                .cloned();
            let Some(key) = oldest else { break };

            if self.windows.get(&key).is_some_and(WindowAccumulator::is_dirty) {
                self.flush_window(&key).await;
            }
            self.windows.remove(&key);
            debug!(window = %key, "Evicted aggregation window past cap");
        }
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn flushed_total(&self) -> u64 {
        self.flushed_total
    }
}

/// Aggregator task: folds accepted measurements and sweeps on an interval.
/// Flushes all open windows on shutdown.
pub async fn run_aggregator(
    mut aggregator: HourlyAggregator,
    mut measurements: mpsc::Receiver<Measurement>,
    sweep_secs: u64,
    cancel: CancellationToken,
) {
    info!(sweep_secs = sweep_secs, "📊 Hourly aggregator started");
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_secs.max(1)));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[Aggregator] Received shutdown signal, flushing open windows");
                aggregator.flush_all().await;
                return;
            }
            maybe = measurements.recv() => {
                match maybe {
                    Some(measurement) => aggregator.accumulate(&measurement),
                    None => {
                        info!("[Aggregator] Measurement channel closed, flushing open windows");
                        aggregator.flush_all().await;
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                aggregator.sweep().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{AqiCategory, WeatherSample};

    fn make_measurement(city: &str, timestamp: DateTime<Utc>, pm25: f64, aqi: u16) -> Measurement {
        Measurement {
            city: city.to_string(),
            country: "XX".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            timestamp,
            source: "test".to_string(),
            pm25: Some(pm25),
            pm10: None,
            co: None,
            no2: None,
            o3: None,
            so2: None,
            aqi,
            aqi_category: AqiCategory::Good,
            weather: WeatherSample::default(),
            ingested_at: Utc::now(),
        }
    }

    fn test_config(max_open_windows: usize) -> AggregationConfig {
        AggregationConfig {
            grace_period_secs: 600,
            flush_sweep_secs: 60,
            max_open_windows,
        }
    }

    fn make_aggregator(
        store: Arc<dyn StoreAdapter>,
        max_open_windows: usize,
    ) -> HourlyAggregator {
        HourlyAggregator::new(
            store,
            Arc::new(RetryQueue::new(16)),
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_attempts: 2,
                max_delay: Duration::from_millis(5),
            },
            &test_config(max_open_windows),
            None,
        )
    }

    #[test]
    fn test_accumulator_means_and_extrema() {
        let key = WindowKey::for_timestamp("London", Utc::now());
        let mut window = WindowAccumulator::new(key.clone());

        window.accumulate(&make_measurement("London", Utc::now(), 10.0, 40), false);
        window.accumulate(&make_measurement("London", Utc::now(), 20.0, 60), false);

        let row = window.snapshot();
        assert_eq!(row.avg_pm25, Some(15.0));
        assert_eq!(row.avg_pm10, None);
        assert_eq!(row.avg_aqi, 50.0);
        assert_eq!(row.min_aqi, 40);
        assert_eq!(row.max_aqi, 60);
        assert_eq!(row.measurement_count, 2);
    }

    #[test]
    fn test_accumulator_partial_pollutant_coverage() {
        let mut window = WindowAccumulator::new(WindowKey::for_timestamp("London", Utc::now()));

        let mut only_pm10 = make_measurement("London", Utc::now(), 0.0, 30);
        only_pm10.pm25 = None;
        only_pm10.pm10 = Some(44.0);

        window.accumulate(&make_measurement("London", Utc::now(), 12.0, 50), false);
        window.accumulate(&only_pm10, false);

        let row = window.snapshot();
        // each mean covers only the measurements that carried the field
        assert_eq!(row.avg_pm25, Some(12.0));
        assert_eq!(row.avg_pm10, Some(44.0));
        assert_eq!(row.measurement_count, 2);
    }

    #[test]
    fn test_snapshot_deterministic_without_new_data() {
        let mut window = WindowAccumulator::new(WindowKey::for_timestamp("London", Utc::now()));
        window.accumulate(&make_measurement("London", Utc::now(), 12.0, 50), false);
        assert_eq!(window.snapshot(), window.snapshot());
    }

    #[tokio::test]
    async fn test_sweep_flushes_only_past_grace() {
        let store = Arc::new(MemoryStore::new());
        let mut aggregator = make_aggregator(store.clone(), 64);

        let old = Utc::now() - TimeDelta::hours(2);
        aggregator.accumulate(&make_measurement("London", old, 18.0, 64));
        aggregator.accumulate(&make_measurement("London", Utc::now(), 9.0, 38));

        aggregator.sweep().await;

        let rows = store.recent_aggregates("London", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg_pm25, Some(18.0));
        // current-hour window stays open
        assert_eq!(aggregator.open_windows(), 2);
    }

    #[tokio::test]
    async fn test_double_sweep_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut aggregator = make_aggregator(store.clone(), 64);

        let old = Utc::now() - TimeDelta::hours(3);
        aggregator.accumulate(&make_measurement("Delhi", old, 80.0, 165));

        aggregator.sweep().await;
        let first = store.recent_aggregates("Delhi", 1).await.unwrap().remove(0);

        aggregator.sweep().await;
        let second = store.recent_aggregates("Delhi", 1).await.unwrap().remove(0);

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_late_data_refreshes_flushed_window() {
        let store = Arc::new(MemoryStore::new());
        let mut aggregator = make_aggregator(store.clone(), 64);

        let old = Utc::now() - TimeDelta::hours(2);
        aggregator.accumulate(&make_measurement("Tokyo", old, 10.0, 42));
        aggregator.sweep().await;

        // same hour, arriving well past the grace period
        aggregator.accumulate(&make_measurement("Tokyo", old + TimeDelta::minutes(5), 30.0, 88));
        aggregator.sweep().await;

        let rows = store.recent_aggregates("Tokyo", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].measurement_count, 2);
        assert_eq!(rows[0].avg_pm25, Some(20.0));
        assert_eq!(rows[0].max_aqi, 88);
    }

    #[tokio::test]
    async fn test_window_cap_evicts_oldest() {
        let store = Arc::new(MemoryStore::new());
        let mut aggregator = make_aggregator(store.clone(), 2);

        for hours_back in [5, 4, 3] {
            let ts = Utc::now() - TimeDelta::hours(hours_back);
            aggregator.accumulate(&make_measurement("Paris", ts, 10.0, 40));
        }
        assert_eq!(aggregator.open_windows(), 3);

        aggregator.sweep().await;

        assert_eq!(aggregator.open_windows(), 2);
        // nothing was lost: all three windows reached the store
        assert_eq!(store.recent_aggregates("Paris", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_flushed_rows_forward_to_channel() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::channel(8);
        let mut aggregator = HourlyAggregator::new(
            store,
            Arc::new(RetryQueue::new(16)),
            RetryPolicy::default(),
            &test_config(64),
            Some(tx),
        );

        let old = Utc::now() - TimeDelta::hours(2);
        aggregator.accumulate(&make_measurement("Beijing", old, 95.0, 172));
        aggregator.sweep().await;

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.city, "Beijing");
        assert_eq!(forwarded.measurement_count, 1);
    }
}
