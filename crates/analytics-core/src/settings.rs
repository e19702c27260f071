use chrono::Weekday;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::BreakdownPolicy;
use crate::time_utils::parse_weekday;

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Compressive time-series aggregation for blog analytics
#[derive(Parser, Debug, Clone)]
#[command(
    name = "blog-analytics",
    about = "Compressive time-series aggregation for blog analytics",
    version
)]
pub struct Settings {
    /// SQLite file holding the aggregate store
    #[arg(long, global = true, env = "BLOG_ANALYTICS_DB")]
    pub database: Option<PathBuf>,

    /// Directory of JSONL raw-event files
    #[arg(long, global = true, env = "BLOG_ANALYTICS_EVENTS")]
    pub events_dir: Option<PathBuf>,

    /// First day of a weekly bucket (e.g. mon, sun)
    #[arg(long, global = true, value_parser = parse_weekday)]
    pub week_start: Option<Weekday>,

    /// Dimension breakdowns computed per bucket
    #[arg(long, global = true, value_parser = ["totals", "single", "full"])]
    pub breakdown: Option<String>,

    /// Logging level
    #[arg(long, global = true, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    pub log_level: String,

    /// Log file path
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Persist the effective engine configuration
    #[arg(long, global = true)]
    pub save_config: bool,

    /// Clear saved configuration
    #[arg(long, global = true)]
    pub clear_config: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Backfill aggregates from existing raw events
    Backfill(BackfillArgs),
    /// Run one scheduled aggregation job immediately
    Aggregate(AggregateArgs),
    /// Register the periodic jobs and run them until interrupted
    Schedule,
    /// Query a time series from the aggregate store
    Query(QueryArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BackfillArgs {
    /// Granularity to backfill
    #[arg(long, default_value = "all", value_parser = ["hour", "day", "week", "month", "year", "all"])]
    pub granularity: String,

    /// First day to backfill (YYYY-MM-DD); defaults to the earliest event
    #[arg(long)]
    pub start_date: Option<String>,

    /// Last day to backfill, inclusive (YYYY-MM-DD); defaults to the latest event
    #[arg(long)]
    pub end_date: Option<String>,

    /// Delete existing aggregates of the granularity before backfilling
    #[arg(long)]
    pub clear: bool,

    /// Aggregate family to backfill
    #[arg(long, default_value = "all", value_parser = ["views", "creations", "all"])]
    pub kind: String,
}

#[derive(Args, Debug, Clone)]
pub struct AggregateArgs {
    /// Cadence of the job to run
    #[arg(long, value_parser = ["hourly", "daily", "weekly", "monthly", "yearly"])]
    pub cadence: String,

    /// Treat this instant as "now" (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    pub at: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// Range start (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    pub start: String,

    /// Range end, exclusive (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    pub end: String,

    /// Force a comparison unit instead of choosing one from the span
    #[arg(long, value_parser = ["hour", "day", "week", "month", "year"])]
    pub compare: Option<String>,

    /// Output shape
    #[arg(long, default_value = "performance", value_parser = ["performance", "series", "top"])]
    pub shape: String,

    /// Dimension ranked by the `top` shape
    #[arg(long, default_value = "country", value_parser = ["country", "blog", "author"])]
    pub top: String,

    /// Rows kept by the `top` shape
    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    /// Aggregate family for the `series` and `top` shapes
    #[arg(long, default_value = "views", value_parser = ["views", "creations"])]
    pub kind: String,

    /// Dimension filter as name=value (blog, country, author); repeatable
    #[arg(long = "filter", value_name = "DIMENSION=VALUE")]
    pub filters: Vec<String>,
}

// ── EngineConfig ───────────────────────────────────────────────────────────────

/// Engine configuration persisted to `~/.blog-analytics/config.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// First weekday of a weekly bucket.
    pub week_start: Weekday,
    /// Breakdowns computed when a caller does not name dimension sets.
    pub breakdown: BreakdownPolicy,
    /// Immediate retries of a transiently failing upsert.
    pub write_retries: u32,
    /// Count distinct viewers on view aggregates.
    pub track_unique_viewers: bool,
    /// Delay after a bucket closes before its scheduled job fires.
    pub schedule_grace_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            week_start: Weekday::Mon,
            breakdown: BreakdownPolicy::Single,
            write_retries: 3,
            track_unique_viewers: true,
            schedule_grace_secs: 60,
            database: None,
            events_dir: None,
        }
    }
}

impl EngineConfig {
    /// Directory holding config, logs and the default database.
    pub fn home_dir() -> PathBuf {
        Self::home_dir_in(&dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
    }

    pub fn home_dir_in(base_dir: &Path) -> PathBuf {
        base_dir.join(".blog-analytics")
    }

    /// Return the default path to the persisted config file.
    pub fn config_path() -> PathBuf {
        Self::home_dir().join("config.json")
    }

    /// Default SQLite location when none is configured.
    pub fn default_database() -> PathBuf {
        Self::home_dir().join("aggregates.db")
    }

    /// Load persisted config from the default path.
    /// Returns `Default` when the file is absent or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load persisted config from an explicit path.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
            Self::default()
        })
    }

    /// Atomically write the config to an explicit path, creating parent
    /// directories if needed.
    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;

        // Write to a temp file then rename for atomicity.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }

    /// Delete the config file at an explicit path if it exists.
    pub fn clear_at(path: &Path) -> Result<(), std::io::Error> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Overlay options given explicitly on the command line.
    pub fn apply_overrides(&mut self, settings: &Settings) {
        if let Some(ws) = settings.week_start {
            self.week_start = ws;
        }
        if let Some(policy) = settings.breakdown.as_deref().and_then(|b| b.parse().ok()) {
            self.breakdown = policy;
        }
        if settings.database.is_some() {
            self.database.clone_from(&settings.database);
        }
        if settings.events_dir.is_some() {
            self.events_dir.clone_from(&settings.events_dir);
        }
    }

    /// SQLite path to use, falling back to the default location.
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(Self::default_database)
    }
}

// ── Settings impl ──────────────────────────────────────────────────────────────

impl Settings {
    /// Parse the process arguments and merge them with the persisted config.
    pub fn load_with_config() -> (Self, EngineConfig) {
        Self::load_with_config_impl(std::env::args_os().collect(), &EngineConfig::config_path())
    }

    /// Testable core of [`Settings::load_with_config`].
    ///
    /// CLI flags win over persisted values. `--clear-config` discards the
    /// persisted file first; `--save-config` writes the merged result back.
    pub fn load_with_config_impl(
        args: Vec<std::ffi::OsString>,
        config_path: &Path,
    ) -> (Self, EngineConfig) {
        let settings = Self::parse_from(args);

        if settings.clear_config {
            if let Err(e) = EngineConfig::clear_at(config_path) {
                tracing::warn!(error = %e, "failed to clear saved config");
            }
        }

        let mut config = EngineConfig::load_from(config_path);
        config.apply_overrides(&settings);

        if settings.save_config {
            if let Err(e) = config.save_to(config_path) {
                tracing::warn!(error = %e, "failed to save config");
            }
        }

        (settings, config)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
