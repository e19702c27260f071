//! Domain core for the blog analytics engine.
//!
//! Granularities, time buckets, dimension sets and aggregate records, plus
//! the error type and configuration shared by the data and runtime crates.

pub mod bucketing;
pub mod error;
pub mod models;
pub mod settings;
pub mod time_utils;

pub use error::{AnalyticsError, Result};
