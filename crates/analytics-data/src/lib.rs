//! Data layer for the blog analytics engine.
//!
//! Raw-event sources, the aggregate stores, the aggregation engine that
//! writes per-bucket records, and the query router that reads them back.

pub mod aggregator;
pub mod router;
pub mod source;
pub mod sqlite;
pub mod store;

pub use analytics_core as core;
