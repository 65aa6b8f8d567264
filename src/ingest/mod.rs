//! Deduplicating ingest buffer
//!
//! Accepts normalized measurements from any number of concurrent producers,
//! deduplicates on the (city, source, minute) identity key, and forwards each
//! accepted measurement exactly once to both the aggregator and the detector
//! channels.
//!
//! The seen-set is sharded: the identity key hashes to one of N independent
//! `Mutex<HashMap>` shards, so the check-and-insert is atomic per key while
//! unrelated keys proceed in parallel. No global lock. Keys older than the
//! dedup window are evicted by a periodic sweep to bound memory.

use crate::types::{Measurement, MeasurementKey};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Shard = HashMap<MeasurementKey, DateTime<Utc>>;

/// Outcome of one ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First sighting of this identity key; forwarded downstream.
    Accepted,
    /// Identity key already seen inside the dedup window; dropped.
    DuplicateSuppressed,
}

/// Ingest failures. Duplicates are an outcome, not an error.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("downstream pipeline stage has shut down")]
    Closed,
}

/// Sharded deduplicating buffer between producers and the pipeline tasks.
pub struct IngestBuffer {
    shards: Vec<Mutex<Shard>>,
    dedup_window: TimeDelta,
    aggregator_tx: mpsc::Sender<Measurement>,
    detector_tx: mpsc::Sender<Measurement>,
}

impl IngestBuffer {
    /// Build a buffer plus the receiving ends of the aggregator and detector
    /// channels. Channels are bounded so a stalled consumer applies
    /// backpressure to producers instead of growing memory.
    pub fn new(
        shard_count: usize,
        dedup_window_hours: i64,
        channel_capacity: usize,
    ) -> (Self, mpsc::Receiver<Measurement>, mpsc::Receiver<Measurement>) {
        let (aggregator_tx, aggregator_rx) = mpsc::channel(channel_capacity.max(1));
        let (detector_tx, detector_rx) = mpsc::channel(channel_capacity.max(1));

        let shards = (0..shard_count.max(1)).map(|_| Mutex::new(Shard::new())).collect();

        let buffer = Self {
            shards,
            dedup_window: TimeDelta::hours(dedup_window_hours.max(1)),
            aggregator_tx,
            detector_tx,
        };
        (buffer, aggregator_rx, detector_rx)
    }

    /// Deduplicate and forward one measurement.
    ///
    /// The identity check-and-insert is atomic per key; the shard lock is
    /// released before any channel send, so backpressure never holds a lock.
    pub async fn ingest(&self, measurement: Measurement) -> Result<IngestOutcome, IngestError> {
        let key = measurement.identity_key();

        if !self.check_and_insert(key.clone()) {
            debug!(key = %key, "Duplicate measurement suppressed");
            return Ok(IngestOutcome::DuplicateSuppressed);
        }

        self.aggregator_tx
            .send(measurement.clone())
            .await
            .map_err(|_| IngestError::Closed)?;
        self.detector_tx
            .send(measurement)
            .await
            .map_err(|_| IngestError::Closed)?;

        Ok(IngestOutcome::Accepted)
    }

    /// True if the key was new and is now recorded.
    fn check_and_insert(&self, key: MeasurementKey) -> bool {
        let index = self.shard_index(&key);
        let mut shard = self.lock_shard(index);
        match shard.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                true
            }
        }
    }

    /// Drop keys first seen before the dedup window. Returns evicted count.
    pub fn evict_expired(&self) -> usize {
        self.evict_older_than(Utc::now() - self.dedup_window)
    }

    /// Drop keys first seen before `cutoff`.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        for index in 0..self.shards.len() {
            let mut shard = self.lock_shard(index);
            let before = shard.len();
            shard.retain(|_, first_seen| *first_seen >= cutoff);
            evicted += before - shard.len();
        }
        evicted
    }

    /// Identity keys currently tracked across all shards.
    pub fn tracked_keys(&self) -> usize {
        (0..self.shards.len()).map(|i| self.lock_shard(i).len()).sum()
    }

    fn shard_index(&self, key: &MeasurementKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    fn lock_shard(&self, index: usize) -> MutexGuard<'_, Shard> {
        // A poisoned shard still holds valid keys; recover the guard.
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodic dedup-window eviction. Runs until cancelled.
pub async fn run_eviction_sweep(
    buffer: std::sync::Arc<IngestBuffer>,
    sweep_secs: u64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_secs.max(1)));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[DedupSweep] Received shutdown signal");
                return;
            }
            _ = interval.tick() => {
                let evicted = buffer.evict_expired();
                if evicted > 0 {
                    debug!(
                        evicted = evicted,
                        tracked = buffer.tracked_keys(),
                        "[DedupSweep] Evicted expired identity keys"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AqiCategory, WeatherSample};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn measurement(city: &str, source: &str, second: u32) -> Measurement {
        Measurement {
            city: city.to_string(),
            country: "XX".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, second).unwrap(),
            source: source.to_string(),
            pm25: Some(12.0),
            pm10: None,
            co: None,
            no2: None,
            o3: None,
            so2: None,
            aqi: 50,
            aqi_category: AqiCategory::Good,
            weather: WeatherSample::default(),
            ingested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_double_ingest_suppresses_second() {
        let (buffer, mut agg_rx, mut det_rx) = IngestBuffer::new(8, 48, 16);

        let first = buffer.ingest(measurement("London", "openaq", 5)).await.unwrap();
        // Same city/source/minute, different second: same identity
        let second = buffer.ingest(measurement("London", "openaq", 42)).await.unwrap();

        assert_eq!(first, IngestOutcome::Accepted);
        assert_eq!(second, IngestOutcome::DuplicateSuppressed);

        // Exactly one copy reached each channel
        assert!(agg_rx.recv().await.is_some());
        assert!(det_rx.recv().await.is_some());
        assert!(agg_rx.try_recv().is_err());
        assert!(det_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sources_are_distinct_identities() {
        let (buffer, _agg_rx, _det_rx) = IngestBuffer::new(8, 48, 16);

        let a = buffer.ingest(measurement("London", "openaq", 0)).await.unwrap();
        let b = buffer.ingest(measurement("London", "iqair", 0)).await.unwrap();

        assert_eq!(a, IngestOutcome::Accepted);
        assert_eq!(b, IngestOutcome::Accepted);
        assert_eq!(buffer.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn test_hundred_concurrent_distinct_keys_all_accepted() {
        let (buffer, mut agg_rx, mut det_rx) = IngestBuffer::new(16, 48, 256);
        let buffer = Arc::new(buffer);

        let mut handles = Vec::new();
        for i in 0..100u32 {
            let buffer = Arc::clone(&buffer);
            handles.push(tokio::spawn(async move {
                let city = format!("City-{}", i % 10);
                let source = format!("source-{}", i / 10);
                buffer.ingest(measurement(&city, &source, 0)).await.unwrap()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() == IngestOutcome::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 100);

        for _ in 0..100 {
            assert!(agg_rx.recv().await.is_some());
            assert!(det_rx.recv().await.is_some());
        }
        assert!(agg_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_same_key_accepts_exactly_once() {
        let (buffer, _agg_rx, _det_rx) = IngestBuffer::new(4, 48, 64);
        let buffer = Arc::new(buffer);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let buffer = Arc::clone(&buffer);
            handles.push(tokio::spawn(async move {
                buffer.ingest(measurement("Paris", "openaq", 0)).await.unwrap()
            }));
        }

        let mut accepted = 0;
        let mut suppressed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                IngestOutcome::Accepted => accepted += 1,
                IngestOutcome::DuplicateSuppressed => suppressed += 1,
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(suppressed, 9);
    }

    #[tokio::test]
    async fn test_eviction_forgets_old_keys() {
        let (buffer, _agg_rx, _det_rx) = IngestBuffer::new(8, 48, 16);

        buffer.ingest(measurement("Tokyo", "openaq", 0)).await.unwrap();
        assert_eq!(buffer.tracked_keys(), 1);

        // Future cutoff evicts everything currently tracked
        let evicted = buffer.evict_older_than(Utc::now() + TimeDelta::hours(1));
        assert_eq!(evicted, 1);
        assert_eq!(buffer.tracked_keys(), 0);

        // The key is acceptable again after eviction
        let again = buffer.ingest(measurement("Tokyo", "openaq", 0)).await.unwrap();
        assert_eq!(again, IngestOutcome::Accepted);
    }
}
