use chrono::{DateTime, Utc};
use thiserror::Error;

/// All errors produced by the analytics engine.
#[derive(Error, Debug)]
pub enum AnalyticsError {
    /// A granularity string is not one of `hour|day|week|month|year`.
    #[error("Invalid granularity: {0}")]
    InvalidGranularity(String),

    /// A time range is empty or inverted.
    #[error("Invalid range: end {end} is not after start {start}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// A filter named a dimension the aggregates are not keyed by.
    #[error("Unknown dimension: {0}")]
    UnknownDimension(String),

    /// A filter the stored breakdown cannot answer exactly.
    #[error("Unsupported filter {filter}: {reason}")]
    UnsupportedFilter { filter: String, reason: String },

    /// A dimension value failed validation (e.g. a malformed country code).
    #[error("Invalid value for dimension {dimension}: {value}")]
    InvalidDimensionValue { dimension: String, value: String },

    /// A date or timestamp string did not match any recognised format.
    #[error("Invalid timestamp format: {0}")]
    TimestampParse(String),

    /// The raw-event or finer-aggregate source could not be read.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// An upsert kept failing transiently after the configured retries.
    #[error("Write conflict on {key} after {attempts} attempts")]
    WriteConflict { key: String, attempts: u32 },

    /// A non-transient failure inside an aggregate store.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A JSON document could not be parsed.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Pass-through for any raw I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for errors from third-party crates via `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AnalyticsError {
    /// Errors caused by the caller's parameters. These abort a run before any
    /// bucket is touched.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidGranularity(_)
                | Self::InvalidRange { .. }
                | Self::UnknownDimension(_)
                | Self::UnsupportedFilter { .. }
                | Self::InvalidDimensionValue { .. }
                | Self::TimestampParse(_)
        )
    }

    /// Errors worth retrying immediately; upserts are idempotent.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }
}

/// Convenience alias used throughout the analytics crates.
pub type Result<T> = std::result::Result<T, AnalyticsError>;
