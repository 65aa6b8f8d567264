//! City registry: read-only configuration snapshots
//!
//! The pipeline never consults mutable shared city state. Instead it holds a
//! [`RegistryHandle`] and loads an immutable [`CityRegistry`] snapshot per
//! decision; a background task refreshes the snapshot from the store on a
//! schedule. Unknown cities resolve to the default threshold bands, so a new
//! producer coming online degrades detection gracefully instead of failing.

use super::defaults;
use crate::types::{CityConfig, ThresholdBands};
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default escalation bands applied when a city has no explicit entry for a
/// metric (or no entry at all). SO2 deliberately has no default band.
pub fn default_threshold_bands() -> BTreeMap<String, ThresholdBands> {
    let mut bands = BTreeMap::new();
    bands.insert(
        "pm25".to_string(),
        ThresholdBands::new(defaults::PM25_WARNING, defaults::PM25_ALERT, defaults::PM25_CRITICAL),
    );
    bands.insert(
        "pm10".to_string(),
        ThresholdBands::new(defaults::PM10_WARNING, defaults::PM10_ALERT, defaults::PM10_CRITICAL),
    );
    bands.insert(
        "aqi".to_string(),
        ThresholdBands::new(defaults::AQI_WARNING, defaults::AQI_ALERT, defaults::AQI_CRITICAL),
    );
    bands.insert(
        "no2".to_string(),
        ThresholdBands::new(defaults::NO2_WARNING, defaults::NO2_ALERT, defaults::NO2_CRITICAL),
    );
    bands.insert(
        "o3".to_string(),
        ThresholdBands::new(defaults::O3_WARNING, defaults::O3_ALERT, defaults::O3_CRITICAL),
    );
    bands.insert(
        "co".to_string(),
        ThresholdBands::new(defaults::CO_WARNING, defaults::CO_ALERT, defaults::CO_CRITICAL),
    );
    bands
}

/// The default monitored-city set shipped with a fresh deployment.
pub fn seeded_cities() -> Vec<CityConfig> {
    let city = |name: &str, country: &str, lat: f64, lon: f64, tz: &str, population: u64| {
        CityConfig {
            city: name.to_string(),
            country: country.to_string(),
            latitude: lat,
            longitude: lon,
            timezone: tz.to_string(),
            population,
            monitoring_enabled: true,
            thresholds: default_threshold_bands(),
        }
    };

    vec![
        city("New York", "US", 40.7128, -74.0060, "America/New_York", 8_336_000),
        city("Los Angeles", "US", 34.0522, -118.2437, "America/Los_Angeles", 3_979_000),
        city("Chicago", "US", 41.8781, -87.6298, "America/Chicago", 2_693_000),
        city("London", "GB", 51.5074, -0.1278, "Europe/London", 8_982_000),
        city("Paris", "FR", 48.8566, 2.3522, "Europe/Paris", 2_161_000),
        city("Tokyo", "JP", 35.6762, 139.6503, "Asia/Tokyo", 13_960_000),
        city("Delhi", "IN", 28.6139, 77.2090, "Asia/Kolkata", 19_800_000),
        city("Beijing", "CN", 39.9042, 116.4074, "Asia/Shanghai", 21_540_000),
    ]
}

// ============================================================================
// Registry Snapshot
// ============================================================================

/// An immutable snapshot of all known city configurations.
#[derive(Debug, Clone)]
pub struct CityRegistry {
    cities: HashMap<String, CityConfig>,
    defaults: BTreeMap<String, ThresholdBands>,
}

impl CityRegistry {
    /// Registry holding the seeded city set.
    pub fn seeded() -> Self {
        Self::from_cities(seeded_cities())
    }

    /// Registry from an explicit city list (e.g. loaded from the store).
    pub fn from_cities(cities: Vec<CityConfig>) -> Self {
        let cities = cities
            .into_iter()
            .map(|c| (c.city.clone(), c))
            .collect();
        Self {
            cities,
            defaults: default_threshold_bands(),
        }
    }

    /// Empty registry (every city unknown). Used in tests.
    pub fn empty() -> Self {
        Self {
            cities: HashMap::new(),
            defaults: default_threshold_bands(),
        }
    }

    pub fn get(&self, city: &str) -> Option<&CityConfig> {
        self.cities.get(city)
    }

    pub fn is_known(&self, city: &str) -> bool {
        self.cities.contains_key(city)
    }

    /// Threshold bands for (city, metric).
    ///
    /// Resolution order: the city's explicit entry, then the default bands.
    /// The bool is false when the city itself is unknown, so callers can log
    /// the fallback without a second lookup.
    pub fn bands_for(&self, city: &str, metric: crate::types::Metric) -> (Option<ThresholdBands>, bool) {
        match self.cities.get(city) {
            Some(config) => {
                let bands = config
                    .threshold_for(metric)
                    .or_else(|| self.defaults.get(metric.as_str()))
                    .copied();
                (bands, true)
            }
            None => (self.defaults.get(metric.as_str()).copied(), false),
        }
    }

    /// Whether measurements for this city should flow at all.
    ///
    /// Unknown cities are monitored (they auto-register); known cities honor
    /// their `monitoring_enabled` flag.
    pub fn monitoring_enabled(&self, city: &str) -> bool {
        self.cities
            .get(city)
            .map_or(true, |c| c.monitoring_enabled)
    }

    pub fn len(&self) -> usize {
        self.cities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cities.is_empty()
    }

    pub fn city_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cities.keys().cloned().collect();
        names.sort();
        names
    }
}

// ============================================================================
// Registry Handle
// ============================================================================

/// Shared, lock-free handle to the current registry snapshot.
///
/// Readers call [`RegistryHandle::current`] and work against that immutable
/// snapshot for the whole decision; the refresh task swaps in a fresh one
/// atomically.
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Arc<ArcSwap<CityRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: CityRegistry) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(registry)),
        }
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<CityRegistry> {
        self.inner.load_full()
    }

    /// Atomically replace the snapshot.
    pub fn replace(&self, registry: CityRegistry) {
        self.inner.store(Arc::new(registry));
    }
}

impl std::fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("cities", &self.current().len())
            .finish()
    }
}

/// Periodically reload city configurations from the store into the handle.
///
/// Runs until cancelled. A failed load keeps the previous snapshot; the
/// pipeline never observes a partially-refreshed registry.
pub async fn run_registry_refresh(
    handle: RegistryHandle,
    store: Arc<dyn crate::store::StoreAdapter>,
    refresh_secs: u64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(refresh_secs.max(1)));
    // The first tick fires immediately; skip it since startup already seeded.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[RegistryRefresh] Received shutdown signal");
                return;
            }
            _ = interval.tick() => {
                match store.list_city_configs().await {
                    Ok(cities) if cities.is_empty() => {
                        debug!("[RegistryRefresh] Store has no city configs yet; keeping current snapshot");
                    }
                    Ok(cities) => {
                        let count = cities.len();
                        handle.replace(CityRegistry::from_cities(cities));
                        debug!(cities = count, "[RegistryRefresh] Registry snapshot refreshed");
                    }
                    Err(e) => {
                        warn!(error = %e, "[RegistryRefresh] Failed to reload city configs; keeping current snapshot");
                    }
                }
            }
        }
    }
}
