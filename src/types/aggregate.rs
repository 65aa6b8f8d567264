//! Hourly aggregate rows

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an aggregation window: (city, hour start in UTC).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub city: String,
    pub hour_start: DateTime<Utc>,
}

impl WindowKey {
    /// Window key for a measurement timestamp (UTC hour truncation).
    pub fn for_timestamp(city: &str, timestamp: DateTime<Utc>) -> Self {
        let hour_start = timestamp
            .duration_trunc(TimeDelta::hours(1))
            .unwrap_or(timestamp);
        Self {
            city: city.to_string(),
            hour_start,
        }
    }

    /// End of the window (exclusive).
    pub fn hour_end(&self) -> DateTime<Utc> {
        self.hour_start + TimeDelta::hours(1)
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.city, self.hour_start.format("%Y-%m-%dT%H:00Z"))
    }
}

/// Finalized statistical summary of one city's measurements in one UTC hour.
///
/// Exactly one row exists per (city, hour_start); the store upserts on that
/// identity so re-flushing the same window overwrites in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAggregate {
    pub city: String,
    pub hour_start: DateTime<Utc>,

    // Per-pollutant means over contributing measurements that carried the field
    pub avg_pm25: Option<f64>,
    pub avg_pm10: Option<f64>,
    pub avg_co: Option<f64>,
    pub avg_no2: Option<f64>,
    pub avg_o3: Option<f64>,
    pub avg_so2: Option<f64>,

    /// Mean AQI across contributing measurements
    pub avg_aqi: f64,
    /// Highest AQI seen in the window
    pub max_aqi: u16,
    /// Lowest AQI seen in the window
    pub min_aqi: u16,

    /// Number of measurements folded into this row
    pub measurement_count: u64,

    /// When the window contents last changed
    pub computed_at: DateTime<Utc>,
}

impl HourlyAggregate {
    pub fn window_key(&self) -> WindowKey {
        WindowKey {
            city: self.city.clone(),
            hour_start: self.hour_start,
        }
    }

    /// Mean value for a metric, mirroring `Measurement::value_of`.
    pub fn value_of(&self, metric: super::Metric) -> Option<f64> {
        use super::Metric;
        match metric {
            Metric::Pm25 => self.avg_pm25,
            Metric::Pm10 => self.avg_pm10,
            Metric::Co => self.avg_co,
            Metric::No2 => self.avg_no2,
            Metric::O3 => self.avg_o3,
            Metric::So2 => self.avg_so2,
            Metric::Aqi => Some(self.avg_aqi),
        }
    }
}
