//! Runtime layer for the blog analytics engine.
//!
//! Drives the aggregation engine over time: historical backfills and the
//! cadence jobs that keep recent buckets current.

pub mod backfill;
pub mod scheduler;

pub use analytics_core as core;
pub use analytics_data as data;
