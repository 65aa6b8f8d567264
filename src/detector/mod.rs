//! Anomaly and threshold detection
//!
//! Consumes accepted measurements and finalized hourly aggregates, emits
//! alert candidates for the dedup sink. Two rules run per metric:
//!
//! - Threshold rule: compare the value against the city's configured
//!   escalation bands; the candidate severity is the highest band reached
//!   (inclusive at every boundary).
//! - Anomaly rule: compare the value against a rolling per-(city, metric)
//!   baseline; deviations past the warning band become candidates with
//!   severity scaled by deviation magnitude.
//!
//! A rule that runs and finds the value back below the warning band
//! reports the condition key as cleared, which is what lets the sink
//! close open conditions. Baselines seed lazily from stored history the
//! first time a pair is seen, and reset on a schedule so the statistics
//! track a trailing window rather than growing forever. City
//! configuration arrives as a read-only registry snapshot per evaluation,
//! so the rules themselves stay pure and the store is only touched for
//! baseline history.

mod baseline;

pub use baseline::{MetricBaseline, STD_FLOOR};

use crate::config::{DetectionConfig, RegistryHandle};
use crate::store::StoreAdapter;
use crate::types::{
    AlertCandidate, AlertType, ConditionKey, HourlyAggregate, Measurement, Metric, Severity,
    SinkEvent,
};
use chrono::TimeDelta;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Sigma Bands
// ============================================================================

/// Deviation bands mapping |z| to anomaly severity.
///
/// Plain data so the banding is tunable without touching evaluation
/// logic. Config validation guarantees warning < alert < critical, which
/// makes the mapping monotonic in deviation.
#[derive(Debug, Clone, Copy)]
pub struct SigmaBands {
    pub warning: f64,
    pub alert: f64,
    pub critical: f64,
}

impl SigmaBands {
    pub fn from_config(detection: &DetectionConfig) -> Self {
        Self {
            warning: detection.sigma_warning,
            alert: detection.sigma_alert,
            critical: detection.sigma_critical,
        }
    }

    /// Severity for an absolute z-score, inclusive at each band edge.
    pub fn severity_for(&self, abs_z: f64) -> Option<Severity> {
        if abs_z >= self.critical {
            Some(Severity::Critical)
        } else if abs_z >= self.alert {
            Some(Severity::Alert)
        } else if abs_z >= self.warning {
            Some(Severity::Warning)
        } else {
            None
        }
    }
}

// ============================================================================
// Evaluation Outcome
// ============================================================================

/// Result of evaluating one measurement or aggregate.
///
/// `candidates` are breaches for the sink to deduplicate. `cleared` are
/// condition keys whose rule ran and found the value below the warning
/// band. Rules that did not run appear in neither list.
#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    pub candidates: Vec<AlertCandidate>,
    pub cleared: Vec<ConditionKey>,
}

impl EvaluationOutcome {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty() && self.cleared.is_empty()
    }

    /// Flatten into sink channel events, breaches first.
    pub fn into_events(self) -> impl Iterator<Item = SinkEvent> {
        self.candidates
            .into_iter()
            .map(SinkEvent::Breach)
            .chain(self.cleared.into_iter().map(SinkEvent::Clear))
    }
}

/// What the anomaly rule decided for one (city, metric) value.
enum AnomalyVerdict {
    Breach(AlertCandidate),
    Quiet,
    Skipped,
}

// ============================================================================
// Detector
// ============================================================================

/// Evaluates measurements and aggregates against thresholds and baselines.
///
/// Owned by the detector task; no internal locking. Baseline state is
/// private and keyed city-then-metric.
pub struct Detector {
    registry: RegistryHandle,
    store: Arc<dyn StoreAdapter>,
    sigma_bands: SigmaBands,
    min_baseline_samples: u64,
    baseline_window: TimeDelta,
    baselines: HashMap<String, HashMap<Metric, MetricBaseline>>,
    measurements_evaluated: u64,
    aggregates_evaluated: u64,
    candidates_emitted: u64,
}

impl Detector {
    pub fn new(
        registry: RegistryHandle,
        store: Arc<dyn StoreAdapter>,
        detection: &DetectionConfig,
    ) -> Self {
        Self {
            registry,
            store,
            sigma_bands: SigmaBands::from_config(detection),
            min_baseline_samples: detection.min_baseline_samples,
            baseline_window: TimeDelta::hours(detection.baseline_window_hours),
            baselines: HashMap::new(),
            measurements_evaluated: 0,
            aggregates_evaluated: 0,
            candidates_emitted: 0,
        }
    }

    /// Run both rules against one accepted measurement.
    ///
    /// A measurement can yield several candidates (one per breached
    /// metric, threshold and anomaly independently). Missing baseline
    /// history never blocks the threshold rule.
    pub async fn evaluate(&mut self, measurement: &Measurement) -> EvaluationOutcome {
        let registry = self.registry.current();
        let mut outcome = EvaluationOutcome::default();

        for metric in measurement.present_metrics() {
            let Some(value) = measurement.value_of(metric) else {
                continue;
            };

            let (bands, known_city) = registry.bands_for(&measurement.city, metric);
            if !known_city {
                debug!(
                    city = %measurement.city,
                    "City not in registry, threshold check falls back to default bands"
                );
            }
            if let Some(bands) = bands {
                match bands.severity_for(value) {
                    Some(severity) => outcome.candidates.push(AlertCandidate {
                        city: measurement.city.clone(),
                        metric,
                        alert_type: AlertType::ThresholdBreach,
                        severity,
                        value,
                        reference: bands.level_for(severity),
                        z_score: None,
                        timestamp: measurement.timestamp,
                    }),
                    None => outcome.cleared.push(ConditionKey {
                        city: measurement.city.clone(),
                        metric,
                        alert_type: AlertType::ThresholdBreach,
                    }),
                }
            }

            self.ensure_baseline(&measurement.city, metric).await;
            match self.check_anomaly(measurement, metric, value) {
                AnomalyVerdict::Breach(candidate) => outcome.candidates.push(candidate),
                AnomalyVerdict::Quiet => outcome.cleared.push(ConditionKey {
                    city: measurement.city.clone(),
                    metric,
                    alert_type: AlertType::Anomaly,
                }),
                AnomalyVerdict::Skipped => {}
            }
        }

        self.measurements_evaluated += 1;
        self.candidates_emitted += outcome.candidates.len() as u64;
        outcome
    }

    /// Threshold rule over a finalized hourly aggregate's mean values.
    ///
    /// Aggregates carry no single observation to judge against a
    /// baseline, so only the threshold rule applies. A sustained hourly
    /// mean past a band keeps the condition open at the sink even when
    /// individual readings dip below it.
    pub fn evaluate_aggregate(&mut self, aggregate: &HourlyAggregate) -> EvaluationOutcome {
        let registry = self.registry.current();
        let mut outcome = EvaluationOutcome::default();

        for metric in Metric::ALL {
            let Some(value) = aggregate.value_of(metric) else {
                continue;
            };
            let (bands, _) = registry.bands_for(&aggregate.city, metric);
            let Some(bands) = bands else {
                continue;
            };
            match bands.severity_for(value) {
                Some(severity) => outcome.candidates.push(AlertCandidate {
                    city: aggregate.city.clone(),
                    metric,
                    alert_type: AlertType::ThresholdBreach,
                    severity,
                    value,
                    reference: bands.level_for(severity),
                    z_score: None,
                    timestamp: aggregate.hour_start,
                }),
                None => outcome.cleared.push(ConditionKey {
                    city: aggregate.city.clone(),
                    metric,
                    alert_type: AlertType::ThresholdBreach,
                }),
            }
        }

        self.aggregates_evaluated += 1;
        self.candidates_emitted += outcome.candidates.len() as u64;
        outcome
    }

    /// Judge a value against its baseline, then fold it in.
    ///
    /// Evaluation happens before the update so a spike cannot dampen its
    /// own z-score. Baselines below the sample minimum only accumulate.
    fn check_anomaly(
        &mut self,
        measurement: &Measurement,
        metric: Metric,
        value: f64,
    ) -> AnomalyVerdict {
        let Some(baseline) = self
            .baselines
            .get_mut(&measurement.city)
            .and_then(|per_metric| per_metric.get_mut(&metric))
        else {
            return AnomalyVerdict::Skipped;
        };

        let verdict = if baseline.count() >= self.min_baseline_samples {
            let z = baseline.z_score(value);
            match self.sigma_bands.severity_for(z.abs()) {
                Some(severity) => AnomalyVerdict::Breach(AlertCandidate {
                    city: measurement.city.clone(),
                    metric,
                    alert_type: AlertType::Anomaly,
                    severity,
                    value,
                    reference: baseline.mean(),
                    z_score: Some(z),
                    timestamp: measurement.timestamp,
                }),
                None => AnomalyVerdict::Quiet,
            }
        } else {
            AnomalyVerdict::Skipped
        };

        baseline.observe(value);
        verdict
    }

    /// Create and seed the baseline for a (city, metric) pair if absent.
    ///
    /// Seeds from the trailing history window in the store. A failed
    /// query degrades to an empty baseline that learns from live data,
    /// so detection keeps running without the store.
    async fn ensure_baseline(&mut self, city: &str, metric: Metric) {
        let exists = self
            .baselines
            .get(city)
            .is_some_and(|per_metric| per_metric.contains_key(&metric));
        if exists {
            return;
        }

        let history = match self
            .store
            .query_recent_history(city, metric, self.baseline_window)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(
                    city = %city,
                    metric = %metric,
                    error = %e,
                    "[Detector] Baseline history query failed, learning from live data only"
                );
                Vec::new()
            }
        };

        let baseline = MetricBaseline::seeded(history.into_iter().map(|(_, value)| value));
        if baseline.count() > 0 {
            debug!(
                city = %city,
                metric = %metric,
                samples = baseline.count(),
                mean = baseline.mean(),
                "Baseline seeded from stored history"
            );
        }
        self.baselines
            .entry(city.to_string())
            .or_default()
            .insert(metric, baseline);
    }

    /// Drop all baselines so they re-seed from the trailing window.
    pub fn reset_baselines(&mut self) {
        let dropped = self.tracked_baselines();
        self.baselines.clear();
        if dropped > 0 {
            info!(dropped = dropped, "[Detector] Baselines reset, will re-seed from history");
        }
    }

    /// Samples currently held for a (city, metric) baseline.
    pub fn baseline_samples(&self, city: &str, metric: Metric) -> u64 {
        self.baselines
            .get(city)
            .and_then(|per_metric| per_metric.get(&metric))
            .map_or(0, MetricBaseline::count)
    }

    pub fn tracked_baselines(&self) -> usize {
        self.baselines.values().map(HashMap::len).sum()
    }

    pub fn measurements_evaluated(&self) -> u64 {
        self.measurements_evaluated
    }

    pub fn candidates_emitted(&self) -> u64 {
        self.candidates_emitted
    }
}

// ============================================================================
// Detector Task
// ============================================================================

/// Detector task: evaluates measurements and flushed aggregates, forwards
/// breach and clear events to the alert sink. Stays up until cancelled or
/// until both input channels close.
pub async fn run_detector(
    mut detector: Detector,
    mut measurements: mpsc::Receiver<Measurement>,
    mut aggregates: mpsc::Receiver<HourlyAggregate>,
    events_tx: mpsc::Sender<SinkEvent>,
    refresh_secs: u64,
    cancel: CancellationToken,
) {
    info!(refresh_secs = refresh_secs, "🔍 Detector started");
    let mut refresh = tokio::time::interval(Duration::from_secs(refresh_secs.max(1)));
    refresh.tick().await;

    let mut measurements_open = true;
    let mut aggregates_open = true;

    while measurements_open || aggregates_open {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[Detector] Received shutdown signal");
                break;
            }
            maybe = measurements.recv(), if measurements_open => {
                match maybe {
                    Some(measurement) => {
                        let outcome = detector.evaluate(&measurement).await;
                        if !forward(outcome, &events_tx).await {
                            warn!("[Detector] Sink channel closed, stopping");
                            return;
                        }
                    }
                    None => measurements_open = false,
                }
            }
            maybe = aggregates.recv(), if aggregates_open => {
                match maybe {
                    Some(aggregate) => {
                        let outcome = detector.evaluate_aggregate(&aggregate);
                        if !forward(outcome, &events_tx).await {
                            warn!("[Detector] Sink channel closed, stopping");
                            return;
                        }
                    }
                    None => aggregates_open = false,
                }
            }
            _ = refresh.tick() => {
                detector.reset_baselines();
            }
        }
    }

    info!(
        measurements = detector.measurements_evaluated(),
        candidates = detector.candidates_emitted(),
        baselines = detector.tracked_baselines(),
        "[Detector] Stopped"
    );
}

/// Push an evaluation's events into the sink channel. False when the
/// channel closed.
async fn forward(outcome: EvaluationOutcome, tx: &mpsc::Sender<SinkEvent>) -> bool {
    for event in outcome.into_events() {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CityRegistry;
    use crate::store::MemoryStore;
    use crate::types::{AqiCategory, WeatherSample};
    use chrono::Utc;

    fn make_measurement(city: &str, pm25: f64, aqi: u16) -> Measurement {
        Measurement {
            city: city.to_string(),
            country: "XX".to_string(),
            latitude: 28.6,
            longitude: 77.2,
            timestamp: Utc::now(),
            source: "test".to_string(),
            pm25: Some(pm25),
            pm10: None,
            co: None,
            no2: None,
            o3: None,
            so2: None,
            aqi,
            aqi_category: AqiCategory::from_index(aqi),
            weather: WeatherSample::default(),
            ingested_at: Utc::now(),
        }
    }

    fn make_detector(store: Arc<dyn StoreAdapter>) -> Detector {
        let handle = RegistryHandle::new(CityRegistry::seeded());
        Detector::new(handle, store, &DetectionConfig::default())
    }

    #[test]
    fn test_sigma_bands_inclusive_and_monotonic() {
        let bands = SigmaBands {
            warning: 3.0,
            alert: 4.0,
            critical: 6.0,
        };
        assert_eq!(bands.severity_for(2.9), None);
        assert_eq!(bands.severity_for(3.0), Some(Severity::Warning));
        assert_eq!(bands.severity_for(3.9), Some(Severity::Warning));
        assert_eq!(bands.severity_for(4.0), Some(Severity::Alert));
        assert_eq!(bands.severity_for(5.9), Some(Severity::Alert));
        assert_eq!(bands.severity_for(6.0), Some(Severity::Critical));
        assert_eq!(bands.severity_for(40.0), Some(Severity::Critical));
    }

    #[tokio::test]
    async fn test_threshold_rule_inclusive_at_band_edge() {
        let mut detector = make_detector(Arc::new(MemoryStore::new()));

        // Default pm25 bands are {35, 55, 150}; exactly 55 is an alert.
        let outcome = detector.evaluate(&make_measurement("Delhi", 55.0, 50)).await;
        assert_eq!(outcome.candidates.len(), 1);
        let c = &outcome.candidates[0];
        assert_eq!(c.metric, Metric::Pm25);
        assert_eq!(c.alert_type, AlertType::ThresholdBreach);
        assert_eq!(c.severity, Severity::Alert);
        assert_eq!(c.reference, 55.0);
        assert_eq!(c.z_score, None);

        // Just under the warning band produces no candidate, only clears.
        let outcome = detector.evaluate(&make_measurement("Delhi", 34.9, 50)).await;
        assert!(outcome.candidates.is_empty());
        assert!(outcome.cleared.contains(&ConditionKey {
            city: "Delhi".to_string(),
            metric: Metric::Pm25,
            alert_type: AlertType::ThresholdBreach,
        }));
    }

    #[tokio::test]
    async fn test_unknown_city_falls_back_to_default_bands() {
        let mut detector = make_detector(Arc::new(MemoryStore::new()));

        let outcome = detector
            .evaluate(&make_measurement("Atlantis", 160.0, 50))
            .await;
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].severity, Severity::Critical);
        assert_eq!(outcome.candidates[0].reference, 150.0);
    }

    #[tokio::test]
    async fn test_anomaly_skipped_below_sample_minimum() {
        let mut detector = make_detector(Arc::new(MemoryStore::new()));

        // No stored history: the first nine normal readings only feed the
        // baseline. A skipped anomaly rule neither breaches nor clears.
        for _ in 0..9 {
            let outcome = detector.evaluate(&make_measurement("Tokyo", 10.0, 40)).await;
            assert!(outcome.candidates.is_empty());
            assert!(outcome
                .cleared
                .iter()
                .all(|key| key.alert_type == AlertType::ThresholdBreach));
        }
        assert_eq!(detector.baseline_samples("Tokyo", Metric::Pm25), 9);

        let outcome = detector.evaluate(&make_measurement("Tokyo", 20.0, 40)).await;
        assert!(outcome
            .candidates
            .iter()
            .all(|c| c.alert_type != AlertType::Anomaly));
    }

    #[tokio::test]
    async fn test_anomaly_fires_once_baseline_ready_then_clears() {
        let mut detector = make_detector(Arc::new(MemoryStore::new()));

        // Flat baseline from live data, then a spike far outside it.
        for _ in 0..20 {
            let outcome = detector.evaluate(&make_measurement("Paris", 10.0, 40)).await;
            assert!(outcome.candidates.is_empty());
        }

        let outcome = detector.evaluate(&make_measurement("Paris", 12.0, 40)).await;
        assert_eq!(outcome.candidates.len(), 1);
        let c = &outcome.candidates[0];
        assert_eq!(c.alert_type, AlertType::Anomaly);
        assert_eq!(c.severity, Severity::Critical);
        assert!((c.reference - 10.0).abs() < 1e-9);
        assert!(c.z_score.is_some_and(|z| z > 6.0));

        // Back at the baseline the anomaly rule runs quiet and clears.
        let outcome = detector.evaluate(&make_measurement("Paris", 10.0, 40)).await;
        assert!(outcome.candidates.is_empty());
        assert!(outcome.cleared.contains(&ConditionKey {
            city: "Paris".to_string(),
            metric: Metric::Pm25,
            alert_type: AlertType::Anomaly,
        }));
    }

    #[tokio::test]
    async fn test_baseline_seeded_from_store_history() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..15 {
            let mut m = make_measurement("Delhi", 8.0 + f64::from(i % 5), 45);
            m.timestamp = Utc::now() - TimeDelta::minutes(i64::from(i) * 10 + 10);
            m.source = format!("station-{i}");
            store.append_measurement(&m).await.unwrap();
        }
        let mut detector = make_detector(store);

        // The spike breaches thresholds and deviates from the seeded
        // baseline, so a single measurement yields both candidate kinds.
        let outcome = detector.evaluate(&make_measurement("Delhi", 480.0, 45)).await;
        assert_eq!(outcome.candidates.len(), 2);

        let threshold = outcome
            .candidates
            .iter()
            .find(|c| c.alert_type == AlertType::ThresholdBreach)
            .unwrap();
        assert_eq!(threshold.severity, Severity::Critical);

        let anomaly = outcome
            .candidates
            .iter()
            .find(|c| c.alert_type == AlertType::Anomaly)
            .unwrap();
        assert_eq!(anomaly.severity, Severity::Critical);
        assert!(anomaly.z_score.is_some_and(|z| z > 6.0));
        assert_eq!(detector.baseline_samples("Delhi", Metric::Pm25), 16);
    }

    #[tokio::test]
    async fn test_baseline_reset_drops_state() {
        let mut detector = make_detector(Arc::new(MemoryStore::new()));
        detector.evaluate(&make_measurement("London", 12.0, 40)).await;
        assert!(detector.tracked_baselines() > 0);

        detector.reset_baselines();
        assert_eq!(detector.tracked_baselines(), 0);
        assert_eq!(detector.baseline_samples("London", Metric::Pm25), 0);
    }

    #[tokio::test]
    async fn test_aggregate_threshold_rule() {
        let mut detector = make_detector(Arc::new(MemoryStore::new()));
        let hour_start = Utc::now();
        let aggregate = HourlyAggregate {
            city: "Beijing".to_string(),
            hour_start,
            avg_pm25: Some(160.0),
            avg_pm10: None,
            avg_co: None,
            avg_no2: None,
            avg_o3: None,
            avg_so2: None,
            avg_aqi: 80.0,
            max_aqi: 90,
            min_aqi: 70,
            measurement_count: 12,
            computed_at: Utc::now(),
        };

        let outcome = detector.evaluate_aggregate(&aggregate);
        assert_eq!(outcome.candidates.len(), 1);
        let c = &outcome.candidates[0];
        assert_eq!(c.metric, Metric::Pm25);
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.timestamp, hour_start);

        // A clean hour yields clears for the evaluated metrics instead.
        let calm = HourlyAggregate {
            avg_pm25: Some(12.0),
            avg_aqi: 40.0,
            ..aggregate
        };
        let outcome = detector.evaluate_aggregate(&calm);
        assert!(outcome.candidates.is_empty());
        assert!(!outcome.cleared.is_empty());
    }

    #[tokio::test]
    async fn test_run_detector_forwards_breaches() {
        let detector = make_detector(Arc::new(MemoryStore::new()));
        let (measurement_tx, measurement_rx) = mpsc::channel(8);
        let (_aggregate_tx, aggregate_rx) = mpsc::channel::<HourlyAggregate>(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_detector(
            detector,
            measurement_rx,
            aggregate_rx,
            events_tx,
            3_600,
            cancel.clone(),
        ));

        measurement_tx
            .send(make_measurement("Delhi", 200.0, 50))
            .await
            .unwrap();

        match events_rx.recv().await.unwrap() {
            SinkEvent::Breach(candidate) => {
                assert_eq!(candidate.city, "Delhi");
                assert_eq!(candidate.severity, Severity::Critical);
            }
            SinkEvent::Clear(key) => panic!("expected breach, got clear for {key}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
