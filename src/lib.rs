//! AIRWARDEN: Urban Air Quality Intelligence
//!
//! Streaming pipeline for multi-city air quality monitoring and alerting.
//!
//! ## Architecture
//!
//! - **Normalizer**: Raw reading validation, range clamping, AQI computation
//! - **Ingest Buffer**: Sharded dedup window keyed by (city, timestamp, source)
//! - **Hourly Aggregator**: Per-city windowed averages flushed to the store
//! - **Detector**: Threshold bands plus rolling z-score anomaly baselines
//! - **Alert Sink**: Severity-deduplicated alert emission with retry parking

// Core pipeline modules
pub mod config;
pub mod types;
pub mod aqi;
pub mod normalizer;
pub mod ingest;
pub mod aggregate;
pub mod detector;
pub mod alerts;
pub mod store;
pub mod pipeline;
pub mod api;

// Re-export monitor configuration
pub use config::{MonitorConfig, RegistryHandle};

// Re-export commonly used types
pub use types::{
    Alert, AlertCandidate, AlertType, AqiCategory, ConditionKey, HourlyAggregate,
    Measurement, Metric, RawReading, Severity, SinkEvent, WeatherSample, WindowKey,
};

// Re-export city configuration types
pub use types::{CityConfig, ThresholdBands};

// Re-export pipeline stages
pub use aggregate::HourlyAggregator;
pub use alerts::AlertSink;
pub use detector::Detector;
pub use ingest::IngestBuffer;

// Re-export storage
pub use store::{MemoryStore, SledStore, StoreAdapter, StoreError};
