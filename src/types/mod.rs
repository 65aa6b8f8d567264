//! Shared data structures for the air-quality monitoring pipeline
//!
//! This module defines the core types flowing through the pipeline:
//! - Ingestion: RawReading (upstream feed record)
//! - Normalization: Measurement (validated, AQI-stamped, immutable)
//! - Aggregation: HourlyAggregate (per city, per UTC hour)
//! - Detection: AlertCandidate (threshold breach or statistical anomaly)
//! - Sink: Alert (persisted, operator-acknowledgeable)
//! - Configuration: CityConfig, ThresholdBands

mod measurement;
mod aggregate;
mod city;
mod alert;

pub use measurement::*;
pub use aggregate::*;
pub use city::*;
pub use alert::*;
