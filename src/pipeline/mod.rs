//! Processing Pipeline Module
//!
//! ## Stage layout
//!
//! ```text
//! source ──> normalize ──> dedup buffer ──┬──> hourly aggregator ──> store
//!                                         │           │
//!                                         │           └──> flushed rows
//!                                         │                    │
//!                                         └──> detector <──────┘
//!                                                  │
//!                                                  └──> alert sink ──> store
//! ```
//!
//! Exactly one source feeds a process run. Every stage downstream of the
//! dedup buffer sees each accepted measurement once.

pub mod processing_loop;
pub mod source;

pub use processing_loop::{PipelineStats, ProcessingLoop};
pub use source::{CsvSource, ReadingEvent, ReadingSource, StdinSource, SyntheticSource};
