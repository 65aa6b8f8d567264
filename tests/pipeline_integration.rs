//! End-to-End Pipeline Integration Tests
//!
//! Builds the real task graph over an in-memory store (dedup buffer,
//! hourly aggregator, detector, and alert sink wired by the same bounded
//! channels the binary uses) and drives crafted readings through the
//! processing loop.
//!
//! Shutdown is exercised the way a finite source triggers it: once the
//! loop finishes, dropping the ingest buffer closes the fan-out channels,
//! the aggregator flushes its open windows into the detector's aggregate
//! channel, and the close cascades down to the sink. Every assertion runs
//! after all tasks have joined, so there are no sleeps and no races.

use airwarden::aggregate::{run_aggregator, HourlyAggregator};
use airwarden::alerts::{run_alert_sink, AlertSink};
use airwarden::aqi::AqiScale;
use airwarden::config::{CityRegistry, MonitorConfig, RegistryHandle};
use airwarden::detector::{run_detector, Detector};
use airwarden::ingest::IngestBuffer;
use airwarden::pipeline::{CsvSource, PipelineStats, ProcessingLoop};
use airwarden::store::{MemoryStore, RetryPolicy, RetryQueue, StoreAdapter};
use airwarden::types::{
    Alert, AlertType, AqiCategory, CityConfig, Measurement, RawReading, Severity, WeatherSample,
};

use chrono::{TimeDelta, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Harness
// ============================================================================

/// Everything needed to run one pipeline pass end to end.
struct TestPipeline {
    store: Arc<MemoryStore>,
    registry: RegistryHandle,
    stats: Arc<RwLock<PipelineStats>>,
    buffer: Arc<IngestBuffer>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_attempts: 2,
        max_delay: Duration::from_millis(5),
    }
}

/// Config with the anomaly rule effectively disabled, so threshold tests
/// see exactly the alerts their band math predicts.
fn thresholds_only_config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.detection.min_baseline_samples = u64::MAX;
    config
}

/// Spawn aggregator, detector, and sink over the given store and registry,
/// wired exactly like the binary's task graph.
fn spawn_stages(
    store: Arc<MemoryStore>,
    registry: CityRegistry,
    config: &MonitorConfig,
) -> TestPipeline {
    let adapter: Arc<dyn StoreAdapter> = store.clone();
    let registry = RegistryHandle::new(registry);
    let retry_queue = Arc::new(RetryQueue::new(64));
    let policy = fast_policy();

    let (buffer, agg_rx, det_rx) = IngestBuffer::new(
        config.ingest.shard_count,
        config.ingest.dedup_window_hours,
        config.ingest.channel_capacity,
    );
    let buffer = Arc::new(buffer);

    let (flush_tx, flush_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    let aggregator = HourlyAggregator::new(
        Arc::clone(&adapter),
        Arc::clone(&retry_queue),
        policy,
        &config.aggregation,
        Some(flush_tx),
    );
    let detector = Detector::new(registry.clone(), Arc::clone(&adapter), &config.detection);
    let sink = AlertSink::new(adapter, retry_queue, policy);

    let tasks = vec![
        tokio::spawn(run_aggregator(
            aggregator,
            agg_rx,
            config.aggregation.flush_sweep_secs,
            cancel.clone(),
        )),
        tokio::spawn(run_detector(
            detector,
            det_rx,
            flush_rx,
            events_tx,
            config.detection.baseline_refresh_secs,
            cancel.clone(),
        )),
        tokio::spawn(run_alert_sink(sink, events_rx, cancel.clone())),
    ];

    TestPipeline {
        store,
        registry,
        stats: Arc::new(RwLock::new(PipelineStats::default())),
        buffer,
        cancel,
        tasks,
    }
}

/// Drive all readings through the processing loop, then close the channel
/// cascade and wait for every downstream stage to drain and stop.
async fn run_readings(pipeline: TestPipeline, readings: Vec<RawReading>) -> PipelineStats {
    let mut source = CsvSource::new(readings, 0);
    let processing = ProcessingLoop::new(
        pipeline.registry.clone(),
        AqiScale::epa_defaults(),
        Arc::clone(&pipeline.buffer),
        pipeline.store.clone() as Arc<dyn StoreAdapter>,
        Arc::clone(&pipeline.stats),
        pipeline.cancel.clone(),
    );
    let stats = processing.run(&mut source).await;

    // The loop's buffer clone died with it; dropping ours closes the
    // fan-out channels. The aggregator flushes open windows and exits,
    // the detector drains the flushed rows, the sink drains the events.
    drop(pipeline.buffer);
    for task in pipeline.tasks {
        task.await.expect("pipeline task panicked");
    }
    stats
}

// ============================================================================
// Fixtures
// ============================================================================

fn reading(city: &str, timestamp: &str, source: &str) -> RawReading {
    RawReading {
        city: city.to_string(),
        country: "XX".to_string(),
        latitude: 50.0,
        longitude: 10.0,
        timestamp: timestamp.to_string(),
        source: source.to_string(),
        pm25: None,
        pm10: None,
        co: None,
        no2: None,
        o3: None,
        so2: None,
        temperature: None,
        humidity: None,
        pressure: None,
        wind_speed: None,
    }
}

fn pm25_reading(city: &str, minute: u32, pm25: f64) -> RawReading {
    let mut raw = reading(city, &format!("2024-03-15T10:{minute:02}:00Z"), "openaq");
    raw.pm25 = Some(pm25);
    raw
}

/// Hand-built stored measurement for baseline seeding; bypasses the
/// pipeline entirely.
fn so2_history_row(city: &str, minutes_ago: i64, so2: f64) -> Measurement {
    let timestamp = Utc::now() - TimeDelta::minutes(minutes_ago);
    Measurement {
        city: city.to_string(),
        country: "FI".to_string(),
        latitude: 60.17,
        longitude: 24.94,
        timestamp,
        source: "openaq".to_string(),
        pm25: None,
        pm10: None,
        co: None,
        no2: None,
        o3: None,
        so2: Some(so2),
        aqi: 50,
        aqi_category: AqiCategory::from_index(50),
        weather: WeatherSample::default(),
        ingested_at: timestamp,
    }
}

fn alerts_for_metric<'a>(alerts: &'a [Alert], metric: &str) -> Vec<&'a Alert> {
    alerts.iter().filter(|a| a.metric == metric).collect()
}

// ============================================================================
// Tests
// ============================================================================

/// A mixed stream: clean readings, one duplicate identity, one implausible
/// value, one never-seen city. Checks the loop's counters, the persisted
/// rows, the shutdown flush of open windows, and auto-registration.
#[tokio::test]
async fn test_end_to_end_accept_dedup_reject_and_flush() {
    let pipeline = spawn_stages(
        Arc::new(MemoryStore::new()),
        CityRegistry::seeded(),
        &thresholds_only_config(),
    );
    let store = pipeline.store.clone();

    let mut duplicate = pm25_reading("London", 2, 99.0);
    duplicate.timestamp = "2024-03-15T10:02:30Z".to_string(); // same minute, same identity
    let rejected = pm25_reading("London", 6, -5.0);

    let mut unknown_city = reading("Reykjavik", "2024-03-15T10:00:00Z", "openaq");
    unknown_city.pm25 = Some(7.0);

    let readings = vec![
        pm25_reading("London", 0, 12.0),
        pm25_reading("London", 1, 13.0),
        pm25_reading("London", 2, 14.0),
        duplicate,
        pm25_reading("London", 3, 15.0),
        pm25_reading("London", 4, 16.0),
        rejected,
        unknown_city,
    ];

    let stats = run_readings(pipeline, readings).await;
    eprintln!("Final stats: {stats}");

    // Step 1: the loop classified every reading exactly once
    assert_eq!(stats.readings_in, 8);
    assert_eq!(stats.accepted, 6, "5 London + 1 Reykjavik should pass");
    assert_eq!(stats.duplicates_suppressed, 1);
    assert_eq!(stats.rejected, 1, "negative pm25 must be rejected");
    assert_eq!(stats.cities_auto_registered, 1);
    assert_eq!(stats.append_failures, 0);

    // Step 2: accepted measurements were persisted, duplicate was not
    assert_eq!(store.measurement_count(), 6);
    let latest = store
        .latest_measurement("London")
        .await
        .unwrap()
        .expect("London has measurements");
    assert_eq!(latest.pm25, Some(16.0), "latest row should be the 10:04 reading");

    // Step 3: shutdown flushed the open windows, one row per (city, hour)
    let london = store.recent_aggregates("London", 10).await.unwrap();
    assert_eq!(london.len(), 1, "all London readings share one UTC hour");
    assert_eq!(london[0].measurement_count, 5, "duplicate must not contribute");
    let avg = london[0].avg_pm25.expect("pm25 contributed to the window");
    assert!(
        (avg - 14.0).abs() < 1e-9,
        "mean of 12..16 should be 14.0, got {avg}"
    );
    assert!(london[0].max_aqi >= london[0].min_aqi);

    let reykjavik = store.recent_aggregates("Reykjavik", 10).await.unwrap();
    assert_eq!(reykjavik.len(), 1);
    assert_eq!(reykjavik[0].measurement_count, 1);

    // Step 4: the unknown city now has a stored config with default bands
    let config = store
        .get_city_config("Reykjavik")
        .await
        .unwrap()
        .expect("auto-registration should persist a config");
    assert!(config.monitoring_enabled);
    assert!(config.thresholds.contains_key("pm25"));

    // Step 5: clean air, no alerts
    let alerts = store.recent_alerts(50).await.unwrap();
    assert!(alerts.is_empty(), "unexpected alerts: {alerts:?}");
}

/// Four consecutive critical readings in one hour must produce exactly one
/// alert per breached condition (pm25 and the derived AQI), not four. The
/// flushed hourly window re-asserts the same conditions and must also be
/// suppressed.
#[tokio::test]
async fn test_sustained_breach_emits_one_alert_per_condition() {
    let pipeline = spawn_stages(
        Arc::new(MemoryStore::new()),
        CityRegistry::seeded(),
        &thresholds_only_config(),
    );
    let store = pipeline.store.clone();

    let readings = vec![
        pm25_reading("Delhi", 0, 180.0),
        pm25_reading("Delhi", 1, 185.0),
        pm25_reading("Delhi", 2, 190.0),
        pm25_reading("Delhi", 3, 195.0),
    ];

    let stats = run_readings(pipeline, readings).await;
    assert_eq!(stats.accepted, 4);

    let alerts = store.recent_alerts(50).await.unwrap();
    eprintln!("Alerts after sustained breach: {alerts:#?}");

    // One condition per (city, metric, type): pm25 plus its AQI companion
    assert_eq!(
        alerts.len(),
        2,
        "steady-state breaches must be deduplicated to one alert per condition"
    );

    let pm25_alerts = alerts_for_metric(&alerts, "pm25");
    assert_eq!(pm25_alerts.len(), 1);
    let alert = pm25_alerts[0];
    assert_eq!(alert.city, "Delhi");
    assert_eq!(alert.alert_type, AlertType::ThresholdBreach);
    assert_eq!(alert.severity, Severity::Critical);
    assert_eq!(alert.value, 180.0, "the first breaching reading opens the condition");
    assert_eq!(alert.threshold, 150.0);
    assert!(!alert.acknowledged);
    assert!(
        alert.message.contains("Hazardous"),
        "critical alerts use the hazardous label: {}",
        alert.message
    );

    let aqi_alerts = alerts_for_metric(&alerts, "aqi");
    assert_eq!(aqi_alerts.len(), 1);
    assert_eq!(aqi_alerts[0].severity, Severity::Critical);

    // The hour flushed with all four readings folded in
    let aggregates = store.recent_aggregates("Delhi", 10).await.unwrap();
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].measurement_count, 4);
    let avg = aggregates[0].avg_pm25.unwrap();
    assert!((avg - 187.5).abs() < 1e-9, "mean of 180..195 step 5, got {avg}");
    assert!(aggregates[0].max_aqi >= 200, "hazardous hour should carry a high AQI");
}

/// Severity lifecycle across one condition: open at warning, suppress the
/// repeat, re-emit on escalation, close on recovery, then open a fresh
/// condition when the value breaches again.
#[tokio::test]
async fn test_escalation_and_clear_lifecycle() {
    let pipeline = spawn_stages(
        Arc::new(MemoryStore::new()),
        CityRegistry::seeded(),
        &thresholds_only_config(),
    );
    let store = pipeline.store.clone();

    let readings = vec![
        pm25_reading("Delhi", 0, 40.0), // warning opens
        pm25_reading("Delhi", 1, 42.0), // warning again: suppressed
        pm25_reading("Delhi", 2, 60.0), // escalates to alert: re-emitted
        pm25_reading("Delhi", 3, 20.0), // below warning: condition closes
        pm25_reading("Delhi", 4, 70.0), // new condition opens at alert
    ];

    run_readings(pipeline, readings).await;

    let mut alerts = store.recent_alerts(50).await.unwrap();
    alerts.reverse(); // chronological

    let pm25_alerts = alerts_for_metric(&alerts, "pm25");
    eprintln!("pm25 alert sequence:");
    for a in &pm25_alerts {
        eprintln!("  {} {} value={}", a.severity, a.message, a.value);
    }

    assert_eq!(
        pm25_alerts.len(),
        3,
        "open + escalation + reopen should emit, repeats should not"
    );

    assert_eq!(pm25_alerts[0].severity, Severity::Warning);
    assert_eq!(pm25_alerts[0].value, 40.0);

    assert_eq!(pm25_alerts[1].severity, Severity::Alert);
    assert_eq!(pm25_alerts[1].value, 60.0);
    assert!(
        pm25_alerts[1].message.starts_with("Escalation:"),
        "severity increase on an open condition is flagged: {}",
        pm25_alerts[1].message
    );

    assert_eq!(pm25_alerts[2].severity, Severity::Alert);
    assert_eq!(pm25_alerts[2].value, 70.0);
    assert!(
        !pm25_alerts[2].message.starts_with("Escalation:"),
        "a condition reopened after a clear is a fresh alert, not an escalation"
    );

    // Each pm25 move has an AQI companion crossing the same way
    assert_eq!(alerts_for_metric(&alerts, "aqi").len(), 3);
    assert_eq!(alerts.len(), 6);
}

/// Anomaly path: a store pre-seeded with 20 steady SO2 samples gives the
/// detector its baseline; a spike far outside that distribution must raise
/// exactly one anomaly alert. SO2 has no default threshold bands, so the
/// threshold rule stays silent throughout.
#[tokio::test]
async fn test_anomaly_alert_from_seeded_baseline() {
    let store = Arc::new(MemoryStore::new());

    // 20 samples alternating 9/11: mean 10, tight spread
    for i in 0..20i64 {
        let value = if i % 2 == 0 { 9.0 } else { 11.0 };
        let row = so2_history_row("Helsinki", 40 - i, value);
        store.append_measurement(&row).await.unwrap();
    }

    let helsinki = CityConfig {
        city: "Helsinki".to_string(),
        country: "FI".to_string(),
        latitude: 60.17,
        longitude: 24.94,
        timezone: "Europe/Helsinki".to_string(),
        population: 650_000,
        monitoring_enabled: true,
        thresholds: BTreeMap::new(),
    };

    let pipeline = spawn_stages(
        store.clone(),
        CityRegistry::from_cities(vec![helsinki]),
        &MonitorConfig::default(),
    );

    let mut spike = reading(
        "Helsinki",
        &(Utc::now() - TimeDelta::minutes(5)).to_rfc3339(),
        "sensor-7",
    );
    spike.so2 = Some(60.0);

    let stats = run_readings(pipeline, vec![spike]).await;
    assert_eq!(stats.accepted, 1);
    assert_eq!(store.measurement_count(), 21);

    let alerts = store.recent_alerts(50).await.unwrap();
    eprintln!("Anomaly alerts: {alerts:#?}");
    assert_eq!(alerts.len(), 1, "exactly one anomaly, no threshold companions");

    let alert = &alerts[0];
    assert_eq!(alert.city, "Helsinki");
    assert_eq!(alert.metric, "so2");
    assert_eq!(alert.alert_type, AlertType::Anomaly);
    assert_eq!(alert.value, 60.0);
    assert!(
        alert.severity >= Severity::Alert,
        "a 6x spike over a tight baseline is at least 4 sigma, got {}",
        alert.severity
    );
    assert!(
        alert.threshold < 15.0,
        "anomaly alerts carry the baseline mean as reference, got {}",
        alert.threshold
    );
    assert!(alert.message.contains("anomaly"), "message: {}", alert.message);

    // Only the spike flowed through the aggregator; history was direct appends
    let aggregates = store.recent_aggregates("Helsinki", 10).await.unwrap();
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].measurement_count, 1);
    assert_eq!(aggregates[0].avg_so2, Some(60.0));
}

/// A known city with monitoring disabled is dropped at normalization:
/// nothing is persisted, aggregated, or alerted for it.
#[tokio::test]
async fn test_monitoring_disabled_city_rejected() {
    let oslo = CityConfig {
        city: "Oslo".to_string(),
        country: "NO".to_string(),
        latitude: 59.91,
        longitude: 10.75,
        timezone: "Europe/Oslo".to_string(),
        population: 700_000,
        monitoring_enabled: false,
        thresholds: BTreeMap::new(),
    };

    let pipeline = spawn_stages(
        Arc::new(MemoryStore::new()),
        CityRegistry::from_cities(vec![oslo]),
        &thresholds_only_config(),
    );
    let store = pipeline.store.clone();

    let stats = run_readings(pipeline, vec![pm25_reading("Oslo", 0, 42.0)]).await;

    assert_eq!(stats.readings_in, 1);
    assert_eq!(stats.accepted, 0);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.cities_auto_registered, 0, "known city must not re-register");

    assert_eq!(store.measurement_count(), 0);
    assert!(store.recent_aggregates("Oslo", 10).await.unwrap().is_empty());
    assert!(store.recent_alerts(10).await.unwrap().is_empty());
}
