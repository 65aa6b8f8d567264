//! Reading normalization: raw producer records to validated measurements
//!
//! Pure validation over (reading, registry snapshot, breakpoint scale): no
//! store access, no shared state. Rejections come back as [`NormalizeError`]
//! so the caller can count and log them; nothing here panics on bad input.

use crate::aqi::AqiScale;
use crate::config::CityRegistry;
use crate::types::{AqiCategory, Measurement, Metric, RawReading, WeatherSample};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

// Data-quality bounds. Pollutant values outside these reject the reading;
// weather values outside theirs are dropped field-wise.
const PM25_MAX: f64 = 500.0;
const PM10_MAX: f64 = 600.0;
const CO_MAX: f64 = 50.0;
const TEMPERATURE_RANGE: (f64, f64) = (-60.0, 60.0);
const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);
const PRESSURE_RANGE: (f64, f64) = (800.0, 1100.0);
const WIND_SPEED_RANGE: (f64, f64) = (0.0, 150.0);

/// Why a raw reading was rejected.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("city name is missing")]
    MissingCity,

    #[error("coordinates out of range (lat {latitude}, lon {longitude})")]
    BadCoordinates { latitude: f64, longitude: f64 },

    #[error("timestamp is missing")]
    MissingTimestamp,

    #[error("cannot parse timestamp '{0}'")]
    BadTimestamp(String),

    #[error("{metric} value {value} outside plausible range")]
    PollutantOutOfRange { metric: Metric, value: f64 },

    #[error("no pollutant values present")]
    NoPollutants,

    #[error("monitoring disabled for {0}")]
    MonitoringDisabled(String),
}

impl NormalizeError {
    /// Short tag for rejection counters and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizeError::MissingCity => "missing_city",
            NormalizeError::BadCoordinates { .. } => "bad_coordinates",
            NormalizeError::MissingTimestamp => "missing_timestamp",
            NormalizeError::BadTimestamp(_) => "bad_timestamp",
            NormalizeError::PollutantOutOfRange { .. } => "pollutant_out_of_range",
            NormalizeError::NoPollutants => "no_pollutants",
            NormalizeError::MonitoringDisabled(_) => "monitoring_disabled",
        }
    }
}

/// Validate and canonicalize one raw reading.
///
/// Requires a city name, a parseable timestamp, and at least one pollutant
/// value inside its plausible range. Unknown cities pass through (they
/// auto-register downstream with default bands); known cities with
/// monitoring disabled are rejected here so nothing downstream sees them.
/// The AQI is computed from whichever pollutants are present using the
/// worst-pollutant rule.
pub fn normalize(
    raw: RawReading,
    registry: &CityRegistry,
    scale: &AqiScale,
) -> Result<Measurement, NormalizeError> {
    let city = raw.city.trim();
    if city.is_empty() {
        return Err(NormalizeError::MissingCity);
    }
    if !(-90.0..=90.0).contains(&raw.latitude) || !(-180.0..=180.0).contains(&raw.longitude) {
        return Err(NormalizeError::BadCoordinates {
            latitude: raw.latitude,
            longitude: raw.longitude,
        });
    }
    if !registry.monitoring_enabled(city) {
        return Err(NormalizeError::MonitoringDisabled(city.to_string()));
    }

    let timestamp = parse_timestamp(&raw.timestamp)?;

    if raw.has_no_pollutants() {
        return Err(NormalizeError::NoPollutants);
    }

    let pm25 = check_pollutant(Metric::Pm25, raw.pm25, PM25_MAX)?;
    let pm10 = check_pollutant(Metric::Pm10, raw.pm10, PM10_MAX)?;
    let co = check_pollutant(Metric::Co, raw.co, CO_MAX)?;
    let no2 = check_pollutant(Metric::No2, raw.no2, f64::INFINITY)?;
    let o3 = check_pollutant(Metric::O3, raw.o3, f64::INFINITY)?;
    let so2 = check_pollutant(Metric::So2, raw.so2, f64::INFINITY)?;

    let weather = sanitize_weather(&raw, city);

    let concentrations = [
        (Metric::Pm25, pm25),
        (Metric::Pm10, pm10),
        (Metric::Co, co),
        (Metric::No2, no2),
        (Metric::O3, o3),
        (Metric::So2, so2),
    ]
    .into_iter()
    .filter_map(|(metric, value)| value.map(|v| (metric, v)));

    let (aqi, aqi_category) = scale.overall(concentrations);

    let source = if raw.source.trim().is_empty() {
        "unknown".to_string()
    } else {
        raw.source.trim().to_string()
    };

    Ok(Measurement {
        city: city.to_string(),
        country: raw.country.trim().to_uppercase(),
        latitude: raw.latitude,
        longitude: raw.longitude,
        timestamp,
        source,
        pm25,
        pm10,
        co,
        no2,
        o3,
        so2,
        aqi,
        aqi_category,
        weather,
        ingested_at: Utc::now(),
    })
}

/// Parse a timestamp string: unix seconds, RFC 3339, or a bare ISO 8601
/// datetime without offset (treated as UTC).
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, NormalizeError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(NormalizeError::MissingTimestamp);
    }

    // Try direct numeric parsing first (already epoch seconds)
    if let Ok(epoch) = s.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp(epoch, 0)
            .ok_or_else(|| NormalizeError::BadTimestamp(s.to_string()));
    }

    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            format!("{}Z", s.trim_end_matches('Z'))
                .parse::<DateTime<Utc>>()
                .map_err(|_| NormalizeError::BadTimestamp(s.to_string()))
        })
}

fn check_pollutant(
    metric: Metric,
    value: Option<f64>,
    max: f64,
) -> Result<Option<f64>, NormalizeError> {
    match value {
        None => Ok(None),
        Some(v) if v.is_finite() && v >= 0.0 && v <= max => Ok(Some(v)),
        Some(v) => Err(NormalizeError::PollutantOutOfRange { metric, value: v }),
    }
}

/// Keep only physically plausible weather fields; drop the rest with a log
/// line. Weather is advisory data, so a bad field never rejects the reading.
fn sanitize_weather(raw: &RawReading, city: &str) -> WeatherSample {
    let keep = |field: &'static str, value: Option<f64>, range: (f64, f64)| match value {
        Some(v) if v.is_finite() && v >= range.0 && v <= range.1 => Some(v),
        Some(v) => {
            debug!(city = %city, field = field, value = v, "Dropping implausible weather value");
            None
        }
        None => None,
    };

    WeatherSample {
        temperature: keep("temperature", raw.temperature, TEMPERATURE_RANGE),
        humidity: keep("humidity", raw.humidity, HUMIDITY_RANGE),
        pressure: keep("pressure", raw.pressure, PRESSURE_RANGE),
        wind_speed: keep("wind_speed", raw.wind_speed, WIND_SPEED_RANGE),
    }
}
