use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use analytics_core::settings::EngineConfig;
use analytics_data::source::{EventSource, JsonlEventSource};
use analytics_data::sqlite::SqliteStore;
use analytics_data::store::AggregateStore;
use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ── Directory bootstrap ────────────────────────────────────────────────────────

/// Ensure `~/.blog-analytics/` and its `logs/` and `events/` subdirectories
/// exist.
pub fn ensure_directories() -> anyhow::Result<()> {
    ensure_directories_in(&EngineConfig::home_dir())
}

fn ensure_directories_in(home: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(home)?;
    std::fs::create_dir_all(home.join("logs"))?;
    std::fs::create_dir_all(home.join("events"))?;
    Ok(())
}

/// Directory scanned for raw-event JSONL files when none is configured.
pub fn default_events_dir() -> PathBuf {
    EngineConfig::home_dir().join("events")
}

// ── Logging bootstrap ──────────────────────────────────────────────────────────

/// Map a `--log-level` name to an [`EnvFilter`] directive.
fn level_directive(log_level: &str, debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    match log_level.to_uppercase().as_str() {
        "DEBUG" => "debug".to_string(),
        "INFO" => "info".to_string(),
        "WARNING" => "warn".to_string(),
        "ERROR" | "CRITICAL" => "error".to_string(),
        other => other.to_lowercase(),
    }
}

/// Initialise the global `tracing` subscriber.
///
/// Output goes to stderr; with `log_file` it is also appended to that file
/// without ANSI colours.
pub fn setup_logging(log_level: &str, debug: bool, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level_directive(log_level, debug))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();

    Ok(())
}

// ── Store & source ─────────────────────────────────────────────────────────────

/// Open the SQLite aggregate store named by the config.
pub fn open_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn AggregateStore>> {
    let path = config.database_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("opening aggregate store {}", path.display()))?;
    tracing::debug!(path = %path.display(), "aggregate store opened");
    Ok(Arc::new(store))
}

/// Open the JSONL raw-event directory named by the config.
pub fn open_source(config: &EngineConfig) -> anyhow::Result<Arc<dyn EventSource>> {
    let root = config.events_dir.clone().unwrap_or_else(default_events_dir);
    let source = JsonlEventSource::open(&root)
        .with_context(|| format!("loading raw events from {}", root.display()))?;
    Ok(Arc::new(source))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
