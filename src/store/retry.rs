//! Store write retry: bounded backoff plus a parked-write queue
//!
//! Aggregate flushes and alert persistence must survive a flaky store. The
//! write path first retries in place with exponential backoff; once attempts
//! are exhausted the write parks in the [`RetryQueue`], and a periodic drain
//! pass replays parked writes when the store recovers. The queue is bounded:
//! past capacity the oldest pending write is dropped with an error log.

use super::{StoreAdapter, StoreError};
use crate::types::{Alert, HourlyAggregate};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Backoff policy for transient store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the second attempt; doubles each attempt after.
    pub base_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::StoreConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_attempts: config.retry_max_attempts.max(1),
            max_delay: Duration::from_secs(config.retry_max_delay_secs),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(crate::config::defaults::STORE_RETRY_BASE_DELAY_MS),
            max_attempts: crate::config::defaults::STORE_RETRY_MAX_ATTEMPTS,
            max_delay: Duration::from_secs(crate::config::defaults::STORE_RETRY_MAX_DELAY_SECS),
        }
    }
}

/// Run a store operation, retrying transient failures with backoff.
///
/// Permanent errors return immediately; transient errors retry up to
/// `policy.max_attempts` total attempts, then surface the last error so the
/// caller can park the write.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                warn!(
                    op = op_name,
                    attempts = attempt,
                    error = %e,
                    "Store write failed after all retry attempts"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    op = op_name,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// A write that exhausted its in-place retries.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    Aggregate(HourlyAggregate),
    Alert(Alert),
}

impl PendingWrite {
    fn describe(&self) -> String {
        match self {
            PendingWrite::Aggregate(a) => format!("aggregate {}/{}", a.city, a.hour_start),
            PendingWrite::Alert(a) => format!("alert {}/{}", a.city, a.metric),
        }
    }
}

/// Bounded queue of parked writes awaiting a drain pass.
pub struct RetryQueue {
    pending: Mutex<VecDeque<PendingWrite>>,
    capacity: usize,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Park a write. Past capacity, the oldest parked write is dropped.
    ///
    /// Only the freshest snapshot per aggregate identity is kept: parking an
    /// aggregate drops any older parked snapshot for the same (city, hour).
    pub fn push(&self, write: PendingWrite) {
        let mut pending = self.lock();
        if let PendingWrite::Aggregate(aggregate) = &write {
            pending.retain(|w| {
                !matches!(w, PendingWrite::Aggregate(p)
                    if p.city == aggregate.city && p.hour_start == aggregate.hour_start)
            });
        }
        if pending.len() >= self.capacity {
            if let Some(dropped) = pending.pop_front() {
                error!(
                    write = %dropped.describe(),
                    capacity = self.capacity,
                    "Retry queue full, dropping oldest pending write"
                );
            }
        }
        pending.push_back(write);
    }

    /// Drop any parked snapshot for an aggregate identity. Called after a
    /// fresher flush lands. Best effort: a drain pass may already hold the
    /// snapshot it took before this call; the store's `computed_at` check
    /// rejects that replay.
    pub fn discard_aggregate(&self, city: &str, hour_start: chrono::DateTime<chrono::Utc>) {
        self.lock().retain(|w| {
            !matches!(w, PendingWrite::Aggregate(p) if p.city == city && p.hour_start == hour_start)
        });
    }

    /// Take every parked write, leaving the queue empty.
    pub fn take_all(&self) -> Vec<PendingWrite> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingWrite>> {
        // Parked writes stay valid even if a pushing thread panicked.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replay every parked write once. Writes that fail transiently go back in
/// the queue; permanent failures are dropped with an error log. Returns the
/// number of successfully replayed writes.
pub async fn drain_once(queue: &RetryQueue, store: &Arc<dyn StoreAdapter>) -> usize {
    let pending = queue.take_all();
    if pending.is_empty() {
        return 0;
    }

    let total = pending.len();
    let mut drained = 0;
    for write in pending {
        let result = match &write {
            PendingWrite::Aggregate(aggregate) => store.upsert_hourly_aggregate(aggregate).await,
            PendingWrite::Alert(alert) => store.insert_alert(alert).await.map(|_| ()),
        };

        match result {
            Ok(()) => drained += 1,
            Err(e) if e.is_transient() => {
                queue.push(write);
            }
            Err(e) => {
                error!(write = %write.describe(), error = %e, "Dropping unreplayable parked write");
            }
        }
    }

    if drained > 0 {
        info!(drained = drained, total = total, "💾 Replayed parked store writes");
    }
    drained
}

/// Periodic retry-queue drain. Runs until cancelled, with one final drain
/// attempt at shutdown so parked writes get a last chance to land.
pub async fn run_retry_drain(
    queue: Arc<RetryQueue>,
    store: Arc<dyn StoreAdapter>,
    drain_secs: u64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(drain_secs.max(1)));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[RetryDrain] Received shutdown signal");
                if !queue.is_empty() {
                    let drained = drain_once(&queue, &store).await;
                    info!(drained = drained, remaining = queue.len(), "[RetryDrain] Final drain complete");
                }
                return;
            }
            _ = interval.tick() => {
                drain_once(&queue, &store).await;
            }
        }
    }
}
