//! Alert deduplication and persistence
//!
//! The sink is the single authority on which detector findings become
//! persisted alerts. It keeps an open-condition map keyed (city, metric,
//! alert type): while a condition is open, repeat candidates at the same
//! or lower severity are suppressed, a strictly higher severity escalates,
//! and a clear event closes the condition silently so the next breach
//! alerts fresh. Emitted alerts persist through the store with retry,
//! falling back to the parked-write queue like aggregate flushes do.
//!
//! Notification dispatch (email, webhooks) is not done here; external
//! collaborators read the alert store.

use crate::store::{retry_with_backoff, PendingWrite, RetryPolicy, RetryQueue, StoreAdapter};
use crate::types::{Alert, AlertCandidate, AlertType, ConditionKey, Severity, SinkEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the sink did with one submitted event.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// New or escalated condition; the alert was emitted and persistence
    /// attempted.
    Emitted(Alert),
    /// Same-or-lower severity on an already-open condition.
    Suppressed,
    /// The condition is closed (idempotent; nothing emitted).
    Closed,
}

/// Open-condition tracker and alert writer.
///
/// Owned by the sink task. Dedup state is independent of persistence:
/// a parked insert still opens the condition, so a store outage cannot
/// cause duplicate alerts.
pub struct AlertSink {
    store: Arc<dyn StoreAdapter>,
    retry_queue: Arc<RetryQueue>,
    retry_policy: RetryPolicy,
    open: HashMap<ConditionKey, Severity>,
    emitted_total: u64,
    suppressed_total: u64,
    closed_total: u64,
}

impl AlertSink {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        retry_queue: Arc<RetryQueue>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            retry_queue,
            retry_policy,
            open: HashMap::new(),
            emitted_total: 0,
            suppressed_total: 0,
            closed_total: 0,
        }
    }

    /// Apply one detector event to the open-condition state.
    pub async fn submit(&mut self, event: SinkEvent) -> SubmitOutcome {
        match event {
            SinkEvent::Clear(key) => {
                if self.open.remove(&key).is_some() {
                    self.closed_total += 1;
                    debug!(condition = %key, "Condition closed, value back below the warning band");
                }
                SubmitOutcome::Closed
            }
            SinkEvent::Breach(candidate) => self.submit_breach(candidate).await,
        }
    }

    async fn submit_breach(&mut self, candidate: AlertCandidate) -> SubmitOutcome {
        let key = candidate.condition_key();
        if let Some(&open_severity) = self.open.get(&key) {
            if candidate.severity <= open_severity {
                self.suppressed_total += 1;
                debug!(
                    condition = %key,
                    severity = %candidate.severity,
                    open = %open_severity,
                    "Suppressed candidate for already-open condition"
                );
                return SubmitOutcome::Suppressed;
            }
        }

        let escalation = self.open.insert(key, candidate.severity).is_some();
        let alert = self.persist(build_alert(&candidate, escalation)).await;
        self.emitted_total += 1;
        info!(
            city = %alert.city,
            metric = %alert.metric,
            severity = %alert.severity,
            value = alert.value,
            escalation = escalation,
            "🚨 {}", alert.message
        );
        SubmitOutcome::Emitted(alert)
    }

    /// Insert with retry; exhausted retries park the alert for the drain
    /// pass. The returned alert carries its store id when the insert
    /// landed, 0 when parked.
    async fn persist(&self, mut alert: Alert) -> Alert {
        let store = Arc::clone(&self.store);
        let result =
            retry_with_backoff(&self.retry_policy, "insert_alert", || store.insert_alert(&alert))
                .await;

        match result {
            Ok(id) => alert.id = id,
            Err(e) => {
                warn!(
                    city = %alert.city,
                    metric = %alert.metric,
                    error = %e,
                    "Alert insert failed, parking for retry pass"
                );
                self.retry_queue.push(PendingWrite::Alert(alert.clone()));
            }
        }
        alert
    }

    /// Severity currently open for a condition, if any.
    pub fn open_severity(&self, key: &ConditionKey) -> Option<Severity> {
        self.open.get(key).copied()
    }

    pub fn open_conditions(&self) -> usize {
        self.open.len()
    }

    pub fn emitted_total(&self) -> u64 {
        self.emitted_total
    }

    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_total
    }

    pub fn closed_total(&self) -> u64 {
        self.closed_total
    }
}

fn build_alert(candidate: &AlertCandidate, escalation: bool) -> Alert {
    Alert {
        id: 0,
        city: candidate.city.clone(),
        alert_type: candidate.alert_type,
        severity: candidate.severity,
        metric: candidate.metric.as_str().to_string(),
        value: candidate.value,
        threshold: candidate.reference,
        message: alert_message(candidate, escalation),
        timestamp: candidate.timestamp,
        acknowledged: false,
    }
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Warning => "Elevated",
        Severity::Alert => "High",
        Severity::Critical => "Hazardous",
    }
}

/// Operator-facing message assembled from severity templates.
fn alert_message(candidate: &AlertCandidate, escalation: bool) -> String {
    let label = severity_label(candidate.severity);
    let body = match candidate.alert_type {
        AlertType::ThresholdBreach => format!(
            "{label} {} in {}: {:.1} reached the {} level ({:.1})",
            candidate.metric, candidate.city, candidate.value, candidate.severity,
            candidate.reference,
        ),
        AlertType::Anomaly => format!(
            "{label} {} anomaly in {}: {:.1} deviates {:+.1}σ from baseline {:.1}",
            candidate.metric,
            candidate.city,
            candidate.value,
            candidate.z_score.unwrap_or(0.0),
            candidate.reference,
        ),
    };
    if escalation {
        format!("Escalation: {body}")
    } else {
        body
    }
}

/// Sink task: applies detector events until cancelled or the channel
/// closes.
pub async fn run_alert_sink(
    mut sink: AlertSink,
    mut events: mpsc::Receiver<SinkEvent>,
    cancel: CancellationToken,
) {
    info!("🚨 Alert sink started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[AlertSink] Received shutdown signal");
                break;
            }
            maybe = events.recv() => {
                match maybe {
                    Some(event) => {
                        sink.submit(event).await;
                    }
                    None => {
                        info!("[AlertSink] Event channel closed");
                        break;
                    }
                }
            }
        }
    }
    info!(
        emitted = sink.emitted_total(),
        suppressed = sink.suppressed_total(),
        open = sink.open_conditions(),
        "[AlertSink] Stopped"
    );
}
