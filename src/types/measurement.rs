//! Raw readings and normalized measurements

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Metrics
// ============================================================================

/// A monitored metric: one of the six tracked pollutants, or the derived AQI.
///
/// Threshold bands, anomaly baselines, and alert conditions are all keyed by
/// metric, so the same detection machinery covers raw concentrations and the
/// composite index alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Pm25,
    Pm10,
    Co,
    No2,
    O3,
    So2,
    Aqi,
}

impl Metric {
    /// All metrics, pollutants first.
    pub const ALL: [Metric; 7] = [
        Metric::Pm25,
        Metric::Pm10,
        Metric::Co,
        Metric::No2,
        Metric::O3,
        Metric::So2,
        Metric::Aqi,
    ];

    /// The six pollutant metrics (everything except the derived AQI).
    pub const POLLUTANTS: [Metric; 6] = [
        Metric::Pm25,
        Metric::Pm10,
        Metric::Co,
        Metric::No2,
        Metric::O3,
        Metric::So2,
    ];

    /// Canonical lowercase name, matching config keys and store columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Pm25 => "pm25",
            Metric::Pm10 => "pm10",
            Metric::Co => "co",
            Metric::No2 => "no2",
            Metric::O3 => "o3",
            Metric::So2 => "so2",
            Metric::Aqi => "aqi",
        }
    }

    /// Parse a canonical metric name.
    pub fn parse(name: &str) -> Option<Metric> {
        match name {
            "pm25" => Some(Metric::Pm25),
            "pm10" => Some(Metric::Pm10),
            "co" => Some(Metric::Co),
            "no2" => Some(Metric::No2),
            "o3" => Some(Metric::O3),
            "so2" => Some(Metric::So2),
            "aqi" => Some(Metric::Aqi),
            _ => None,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// AQI Category
// ============================================================================

/// AQI category bands per the EPA index definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AqiCategory {
    Good,
    Moderate,
    UnhealthySensitive,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl AqiCategory {
    /// Category for a 0-500 index value.
    pub fn from_index(aqi: u16) -> Self {
        match aqi {
            0..=50 => AqiCategory::Good,
            51..=100 => AqiCategory::Moderate,
            101..=150 => AqiCategory::UnhealthySensitive,
            151..=200 => AqiCategory::Unhealthy,
            201..=300 => AqiCategory::VeryUnhealthy,
            _ => AqiCategory::Hazardous,
        }
    }
}

impl std::fmt::Display for AqiCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AqiCategory::Good => write!(f, "Good"),
            AqiCategory::Moderate => write!(f, "Moderate"),
            AqiCategory::UnhealthySensitive => write!(f, "Unhealthy for Sensitive Groups"),
            AqiCategory::Unhealthy => write!(f, "Unhealthy"),
            AqiCategory::VeryUnhealthy => write!(f, "Very Unhealthy"),
            AqiCategory::Hazardous => write!(f, "Hazardous"),
        }
    }
}

// ============================================================================
// Raw Reading
// ============================================================================

/// One record from an upstream reading source, before validation.
///
/// Pollutant concentrations are in the units the breakpoint tables expect:
/// µg/m³ for PM2.5/PM10, ppb for O3/NO2/SO2, ppm for CO. The timestamp is a
/// string (RFC 3339 or unix seconds) because upstream producers disagree on
/// format; the Normalizer owns parsing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReading {
    /// City name (registry key)
    pub city: String,

    /// ISO country code, if the producer supplies one
    #[serde(default)]
    pub country: String,

    /// Station latitude in degrees
    #[serde(default)]
    pub latitude: f64,

    /// Station longitude in degrees
    #[serde(default)]
    pub longitude: f64,

    /// Observation timestamp: RFC 3339 string or unix seconds
    pub timestamp: String,

    /// Producer tag ("openaq", "iqair", "simulated", ...)
    #[serde(default = "default_source")]
    pub source: String,

    // Pollutant concentrations; absent fields stay absent downstream
    #[serde(default)]
    pub pm25: Option<f64>,
    #[serde(default)]
    pub pm10: Option<f64>,
    #[serde(default)]
    pub co: Option<f64>,
    #[serde(default)]
    pub no2: Option<f64>,
    #[serde(default)]
    pub o3: Option<f64>,
    #[serde(default)]
    pub so2: Option<f64>,

    // Co-reported weather observations (advisory data, not identity)
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub wind_speed: Option<f64>,
}

fn default_source() -> String {
    "unknown".to_string()
}

impl RawReading {
    /// True if every pollutant field is absent.
    pub fn has_no_pollutants(&self) -> bool {
        self.pm25.is_none()
            && self.pm10.is_none()
            && self.co.is_none()
            && self.no2.is_none()
            && self.o3.is_none()
            && self.so2.is_none()
    }
}

// ============================================================================
// Weather Sample
// ============================================================================

/// Weather observations carried alongside a measurement.
///
/// Individually optional; out-of-range values are dropped field-wise during
/// normalization rather than rejecting the whole reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    /// Air temperature in °C
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Relative humidity in %
    #[serde(default)]
    pub humidity: Option<f64>,
    /// Surface pressure in hPa
    #[serde(default)]
    pub pressure: Option<f64>,
    /// Wind speed in m/s
    #[serde(default)]
    pub wind_speed: Option<f64>,
}

impl WeatherSample {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.pressure.is_none()
            && self.wind_speed.is_none()
    }
}

// ============================================================================
// Measurement
// ============================================================================

/// A validated, AQI-stamped measurement. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// City name
    pub city: String,

    /// ISO country code
    #[serde(default)]
    pub country: String,

    /// Station latitude in degrees
    pub latitude: f64,

    /// Station longitude in degrees
    pub longitude: f64,

    /// Observation timestamp (full resolution; identity truncates to minute)
    pub timestamp: DateTime<Utc>,

    /// Producer tag
    pub source: String,

    // Validated pollutant concentrations
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub o3: Option<f64>,
    pub so2: Option<f64>,

    /// Overall AQI (worst-pollutant rule), 0-500
    pub aqi: u16,

    /// Category band for `aqi`
    pub aqi_category: AqiCategory,

    /// Weather observations that survived validation
    #[serde(default)]
    pub weather: WeatherSample,

    /// When this measurement entered the pipeline
    pub ingested_at: DateTime<Utc>,
}

impl Measurement {
    /// Dedup identity: (city, source, timestamp truncated to minute).
    pub fn identity_key(&self) -> MeasurementKey {
        MeasurementKey {
            city: self.city.clone(),
            source: self.source.clone(),
            minute: self
                .timestamp
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(self.timestamp),
        }
    }

    /// Value for a metric, if present on this measurement.
    pub fn value_of(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Pm25 => self.pm25,
            Metric::Pm10 => self.pm10,
            Metric::Co => self.co,
            Metric::No2 => self.no2,
            Metric::O3 => self.o3,
            Metric::So2 => self.so2,
            Metric::Aqi => Some(f64::from(self.aqi)),
        }
    }

    /// Metrics with a value on this measurement (pollutants present + AQI).
    pub fn present_metrics(&self) -> Vec<Metric> {
        Metric::ALL
            .iter()
            .copied()
            .filter(|m| self.value_of(*m).is_some())
            .collect()
    }
}

/// Dedup identity key for a measurement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeasurementKey {
    pub city: String,
    pub source: String,
    pub minute: DateTime<Utc>,
}

impl std::fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.city, self.source, self.minute.format("%Y-%m-%dT%H:%M"))
    }
}
