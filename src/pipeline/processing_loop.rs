//! Unified reading processing loop shared across all input modes.
//!
//! One loop body serves CSV replay, stdin, and synthetic generation: pull a
//! raw reading, normalize it against the current registry snapshot, register
//! never-seen cities, then hand the measurement to the dedup buffer which
//! fans it out to the aggregator and detector tasks.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::{ReadingEvent, ReadingSource};
use crate::aqi::AqiScale;
use crate::config::{default_threshold_bands, RegistryHandle};
use crate::ingest::{IngestBuffer, IngestError, IngestOutcome};
use crate::normalizer::normalize;
use crate::store::StoreAdapter;
use crate::types::{CityConfig, Measurement, RawReading};

// ============================================================================
// Pipeline Stats
// ============================================================================

/// Counters for one pipeline run. Shared with the HTTP status endpoint.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub readings_in: u64,
    pub accepted: u64,
    pub duplicates_suppressed: u64,
    pub rejected: u64,
    pub cities_auto_registered: u64,
    pub append_failures: u64,
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} readings: {} accepted, {} duplicates, {} rejected ({} cities auto-registered, {} append failures)",
            self.readings_in,
            self.accepted,
            self.duplicates_suppressed,
            self.rejected,
            self.cities_auto_registered,
            self.append_failures
        )
    }
}

// ============================================================================
// Processing Loop
// ============================================================================

/// Owns all state needed for the unified reading loop.
///
/// Built with [`new()`](ProcessingLoop::new), then consumed by
/// [`run()`](ProcessingLoop::run).
pub struct ProcessingLoop {
    registry: RegistryHandle,
    scale: AqiScale,
    buffer: Arc<IngestBuffer>,
    store: Arc<dyn StoreAdapter>,
    stats: Arc<RwLock<PipelineStats>>,
    cancel_token: CancellationToken,
    /// Cities already upserted this run; stops repeat registration while the
    /// registry snapshot lags behind the store.
    registered_this_run: HashSet<String>,
}

impl ProcessingLoop {
    pub fn new(
        registry: RegistryHandle,
        scale: AqiScale,
        buffer: Arc<IngestBuffer>,
        store: Arc<dyn StoreAdapter>,
        stats: Arc<RwLock<PipelineStats>>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            scale,
            buffer,
            store,
            stats,
            cancel_token,
            registered_this_run: HashSet::new(),
        }
    }

    /// Run the processing loop until the source is exhausted, downstream
    /// shuts down, or cancellation.
    ///
    /// Returns final pipeline statistics.
    pub async fn run<S: ReadingSource>(mut self, source: &mut S) -> PipelineStats {
        info!("📡 Processing readings from {}...", source.source_name());
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        loop {
            let event = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("[Pipeline] Shutdown signal received");
                    break;
                }
                result = source.next_reading() => {
                    match result {
                        Ok(ev) => ev,
                        Err(e) => {
                            warn!("[Pipeline] Source error: {}", e);
                            break;
                        }
                    }
                }
            };

            let raw = match event {
                ReadingEvent::Reading(r) => r,
                ReadingEvent::Eof => {
                    let processed = self.stats.read().await.readings_in;
                    info!(
                        "[Pipeline] Source reached end ({} readings processed)",
                        processed
                    );
                    break;
                }
            };

            if !self.process_reading(raw).await {
                break;
            }

            // Progress indicator every 100 readings
            let snapshot = self.stats.read().await.clone();
            if snapshot.readings_in % 100 == 0 {
                info!(
                    "📈 Progress: {} readings | Accepted: {} | Duplicates: {} | Rejected: {}",
                    snapshot.readings_in,
                    snapshot.accepted,
                    snapshot.duplicates_suppressed,
                    snapshot.rejected
                );
            }
        }

        // Final statistics
        let stats = self.stats.read().await.clone();
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("📊 FINAL PIPELINE STATISTICS");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("   Readings In:          {}", stats.readings_in);
        info!("   Accepted:             {}", stats.accepted);
        info!("   Duplicates Dropped:   {}", stats.duplicates_suppressed);
        info!("   Rejected:             {}", stats.rejected);
        info!("   Cities Registered:    {}", stats.cities_auto_registered);
        info!("   Append Failures:      {}", stats.append_failures);
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        stats
    }

    /// Normalize, register, and forward one reading.
    ///
    /// Returns false when downstream channels are gone and the loop should stop.
    async fn process_reading(&mut self, raw: RawReading) -> bool {
        self.stats.write().await.readings_in += 1;

        let snapshot = self.registry.current();
        let measurement = match normalize(raw, &snapshot, &self.scale) {
            Ok(m) => m,
            Err(e) => {
                self.stats.write().await.rejected += 1;
                debug!(reason = e.kind(), "Reading rejected: {}", e);
                return true;
            }
        };

        if !snapshot.is_known(&measurement.city) {
            self.auto_register_city(&measurement).await;
        }

        match self.buffer.ingest(measurement.clone()).await {
            Ok(IngestOutcome::Accepted) => {
                self.stats.write().await.accepted += 1;
                // Raw history is best-effort; aggregates and alerts carry
                // the durability guarantees.
                if let Err(e) = self.store.append_measurement(&measurement).await {
                    self.stats.write().await.append_failures += 1;
                    warn!(city = %measurement.city, error = %e, "Measurement append failed");
                }
                true
            }
            Ok(IngestOutcome::DuplicateSuppressed) => {
                self.stats.write().await.duplicates_suppressed += 1;
                true
            }
            Err(IngestError::Closed) => {
                warn!("[Pipeline] Downstream stage has shut down, stopping reader");
                false
            }
        }
    }

    /// Persist a config for a city first seen in live data.
    ///
    /// The registry snapshot picks it up on the next scheduled refresh; until
    /// then the local set suppresses repeat upserts. A failed upsert is
    /// retried on the city's next reading.
    async fn auto_register_city(&mut self, measurement: &Measurement) {
        if self.registered_this_run.contains(&measurement.city) {
            return;
        }

        let config = CityConfig::auto_registered(
            &measurement.city,
            &measurement.country,
            measurement.latitude,
            measurement.longitude,
            default_threshold_bands(),
        );

        match self.store.upsert_city_config(&config).await {
            Ok(()) => {
                self.registered_this_run.insert(measurement.city.clone());
                self.stats.write().await.cities_auto_registered += 1;
                info!(
                    city = %measurement.city,
                    country = %measurement.country,
                    "🏙️ Auto-registered city with default threshold bands"
                );
            }
            Err(e) => {
                warn!(
                    city = %measurement.city,
                    error = %e,
                    "Failed to auto-register city, will retry on its next reading"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CityRegistry;
    use crate::pipeline::source::CsvSource;
    use crate::store::MemoryStore;

    fn raw(city: &str, minute: u32, pm25: Option<f64>) -> RawReading {
        RawReading {
            city: city.to_string(),
            country: "GB".to_string(),
            latitude: 51.5,
            longitude: -0.12,
            timestamp: format!("2024-03-15T10:{:02}:00Z", minute),
            source: "openaq".to_string(),
            pm25,
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

    struct Harness {
        store: Arc<MemoryStore>,
        agg_rx: tokio::sync::mpsc::Receiver<Measurement>,
        det_rx: tokio::sync::mpsc::Receiver<Measurement>,
    }

    fn make_loop() -> (ProcessingLoop, Harness) {
        let store = Arc::new(MemoryStore::new());
        let (buffer, agg_rx, det_rx) = IngestBuffer::new(4, 48, 64);

        let pipeline = ProcessingLoop::new(
            RegistryHandle::new(CityRegistry::seeded()),
            AqiScale::epa_defaults(),
            Arc::new(buffer),
            Arc::clone(&store) as Arc<dyn StoreAdapter>,
            Arc::new(RwLock::new(PipelineStats::default())),
            CancellationToken::new(),
        );

        (pipeline, Harness { store, agg_rx, det_rx })
    }

    #[tokio::test]
    async fn test_run_accepts_dedups_and_rejects() {
        let (pipeline, mut harness) = make_loop();

        let mut source = CsvSource::new(
            vec![
                raw("London", 30, Some(12.0)),
                // Same city/source/minute: duplicate identity
                raw("London", 30, Some(12.5)),
                // No pollutants at all: rejected by the normalizer
                raw("London", 31, None),
                raw("Paris", 30, Some(8.0)),
            ],
            0,
        );

        let stats = pipeline.run(&mut source).await;

        assert_eq!(stats.readings_in, 4);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.duplicates_suppressed, 1);
        assert_eq!(stats.rejected, 1);

        // Both accepted measurements reached the fan-out channels once
        assert_eq!(harness.agg_rx.recv().await.unwrap().city, "London");
        assert_eq!(harness.agg_rx.recv().await.unwrap().city, "Paris");
        assert!(harness.agg_rx.try_recv().is_err());
        assert!(harness.det_rx.recv().await.is_some());

        // Raw history landed in the store
        let latest = harness.store.latest_measurement("London").await.unwrap();
        assert!(latest.is_some());
    }

    #[tokio::test]
    async fn test_unknown_city_auto_registers_once() {
        let (pipeline, harness) = make_loop();

        let mut source = CsvSource::new(
            vec![
                raw("Springfield", 30, Some(5.0)),
                raw("Springfield", 35, Some(6.0)),
            ],
            0,
        );

        let stats = pipeline.run(&mut source).await;
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.cities_auto_registered, 1);

        let config = harness
            .store
            .get_city_config("Springfield")
            .await
            .unwrap()
            .unwrap();
        assert!(config.monitoring_enabled);
        assert_eq!(config.country, "GB");
        assert_eq!(config.population, 0);
        assert!(config.threshold_for(crate::types::Metric::Pm25).is_some());
    }

    #[tokio::test]
    async fn test_closed_downstream_stops_run() {
        let (pipeline, harness) = make_loop();
        drop(harness.agg_rx);
        drop(harness.det_rx);

        let mut source = CsvSource::new(
            vec![
                raw("London", 30, Some(12.0)),
                raw("Paris", 30, Some(8.0)),
                raw("Tokyo", 30, Some(6.0)),
            ],
            0,
        );

        let stats = pipeline.run(&mut source).await;
        // The first send fails, the loop stops without draining the source
        assert_eq!(stats.readings_in, 1);
        assert_eq!(stats.accepted, 0);
    }
}
