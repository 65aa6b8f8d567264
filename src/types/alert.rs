//! Alerts and alert candidates

use super::Metric;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity, ordered weakest to strongest.
///
/// The derived `Ord` drives escalation decisions: a candidate escalates an
/// open condition only when strictly greater than the open severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Alert,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Alert => write!(f, "alert"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// What kind of condition triggered an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Value reached a configured threshold band
    ThresholdBreach,
    /// Value deviated from the statistical baseline
    Anomaly,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::ThresholdBreach => write!(f, "threshold_breach"),
            AlertType::Anomaly => write!(f, "anomaly"),
        }
    }
}

/// A detector finding, before alert deduplication.
///
/// Candidates are in-process only; the sink decides which become persisted
/// [`Alert`]s. `reference` holds the breached threshold level for threshold
/// candidates, or the baseline mean for anomaly candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub city: String,
    pub metric: Metric,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub value: f64,
    pub reference: f64,
    /// Standard deviations from baseline (anomaly candidates only)
    pub z_score: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl AlertCandidate {
    /// Key of the open condition this candidate belongs to.
    pub fn condition_key(&self) -> ConditionKey {
        ConditionKey {
            city: self.city.clone(),
            metric: self.metric,
            alert_type: self.alert_type,
        }
    }
}

/// Identity of an open alert condition: (city, metric, alert type).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConditionKey {
    pub city: String,
    pub metric: Metric,
    pub alert_type: AlertType,
}

/// One event on the detector-to-sink channel.
///
/// Conditions close on evidence: when a rule runs and finds the value
/// back below the warning band, the detector reports `Clear` so the sink
/// can close the matching open condition. A rule that did not run (no
/// bands configured, baseline not ready) reports nothing, leaving any
/// open condition untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Breach(AlertCandidate),
    Clear(ConditionKey),
}

impl std::fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.city, self.metric, self.alert_type)
    }
}

/// A persisted alert record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Store-assigned sequence id (0 until persisted)
    #[serde(default)]
    pub id: u64,

    pub city: String,
    pub alert_type: AlertType,
    pub severity: Severity,

    /// Canonical metric name ("pm25", ..., "aqi")
    pub metric: String,

    /// Observed value that triggered the alert
    pub value: f64,

    /// Threshold level crossed, or baseline mean for anomalies
    pub threshold: f64,

    /// Operator-facing description
    pub message: String,

    pub timestamp: DateTime<Utc>,

    /// Set by an external operator action, never by the pipeline
    #[serde(default)]
    pub acknowledged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Warning < Severity::Alert);
        assert!(Severity::Alert < Severity::Critical);
        assert_eq!(
            [Severity::Critical, Severity::Warning, Severity::Alert]
                .iter()
                .max(),
            Some(&Severity::Critical)
        );
    }

    #[test]
    fn test_severity_serde_lowercase() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let back: Severity = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(back, Severity::Warning);
    }

    #[test]
    fn test_condition_key_distinguishes_alert_type() {
        let mk = |alert_type| ConditionKey {
            city: "Delhi".to_string(),
            metric: Metric::Pm25,
            alert_type,
        };
        assert_ne!(mk(AlertType::ThresholdBreach), mk(AlertType::Anomaly));
    }
}
