//! Per-city configuration and threshold bands

use super::{Metric, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Three-level escalation thresholds for one metric.
///
/// Comparison is inclusive: a value exactly at a level counts as breaching
/// that level. Levels must be strictly increasing (validated at load time).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBands {
    pub warning: f64,
    pub alert: f64,
    pub critical: f64,
}

impl ThresholdBands {
    pub fn new(warning: f64, alert: f64, critical: f64) -> Self {
        Self {
            warning,
            alert,
            critical,
        }
    }

    /// Check warning < alert < critical.
    pub fn validate(&self) -> Result<(), String> {
        if self.warning < self.alert && self.alert < self.critical {
            Ok(())
        } else {
            Err(format!(
                "threshold bands must be strictly increasing (warning {} / alert {} / critical {})",
                self.warning, self.alert, self.critical
            ))
        }
    }

    /// Highest severity whose level the value reaches (inclusive), if any.
    pub fn severity_for(&self, value: f64) -> Option<Severity> {
        if value >= self.critical {
            Some(Severity::Critical)
        } else if value >= self.alert {
            Some(Severity::Alert)
        } else if value >= self.warning {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    /// The numeric level for a given severity.
    pub fn level_for(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Warning => self.warning,
            Severity::Alert => self.alert,
            Severity::Critical => self.critical,
        }
    }
}

/// Configuration for one monitored city.
///
/// Provisioned at setup, read-only to the pipeline. The detector receives
/// these through a registry snapshot, never by mutating shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityConfig {
    /// City name (unique registry key)
    pub city: String,

    #[serde(default)]
    pub country: String,

    #[serde(default)]
    pub latitude: f64,

    #[serde(default)]
    pub longitude: f64,

    /// IANA timezone name, for collaborators; window identity stays UTC
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub population: u64,

    /// Cities with monitoring disabled are dropped at normalization
    #[serde(default = "default_true")]
    pub monitoring_enabled: bool,

    /// Metric name ("pm25", ..., "aqi") to escalation bands
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdBands>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

impl CityConfig {
    /// Minimal config for an auto-registered city: coordinates from the
    /// first reading, default threshold bands.
    pub fn auto_registered(
        city: &str,
        country: &str,
        latitude: f64,
        longitude: f64,
        thresholds: BTreeMap<String, ThresholdBands>,
    ) -> Self {
        Self {
            city: city.to_string(),
            country: country.to_string(),
            latitude,
            longitude,
            timezone: default_timezone(),
            population: 0,
            monitoring_enabled: true,
            thresholds,
        }
    }

    /// Bands for a metric, if this city configures them.
    pub fn threshold_for(&self, metric: Metric) -> Option<&ThresholdBands> {
        self.thresholds.get(metric.as_str())
    }

    /// Validate every configured band is monotonic and every key is a
    /// known metric name.
    pub fn validate(&self) -> Result<(), String> {
        if self.city.trim().is_empty() {
            return Err("city name must not be empty".to_string());
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(format!("{}: latitude {} out of range", self.city, self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(format!("{}: longitude {} out of range", self.city, self.longitude));
        }
        for (name, bands) in &self.thresholds {
            if Metric::parse(name).is_none() {
                return Err(format!("{}: unknown metric '{}' in thresholds", self.city, name));
            }
            bands
                .validate()
                .map_err(|e| format!("{}: {}: {}", self.city, name, e))?;
        }
        Ok(())
    }
}
