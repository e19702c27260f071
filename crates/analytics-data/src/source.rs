//! Raw-event sources the aggregation engine reads from.
//!
//! The ingestion layer owns raw events; the engine only needs to query them
//! by kind and time range. [`MemoryEventSource`] serves tests and embedded
//! callers, [`JsonlEventSource`] reads a directory of JSONL exports.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use analytics_core::error::{AnalyticsError, Result};
use analytics_core::models::{EventKind, RawEvent};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

// ── EventSource ───────────────────────────────────────────────────────────────

/// Read-only access to raw events.
pub trait EventSource: Send + Sync {
    /// Events of `kind` with `start <= timestamp < end`, oldest first.
    fn events_between(
        &self,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>>;

    /// Earliest and latest timestamp across all events of every kind.
    fn time_span(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;

    /// Pick up events that arrived since the source was loaded.
    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

// ── Sorted snapshot shared by both sources ────────────────────────────────────

#[derive(Debug, Default)]
struct Snapshot {
    /// Sorted by timestamp.
    events: Vec<RawEvent>,
}

impl Snapshot {
    fn new(mut events: Vec<RawEvent>) -> Self {
        events.sort_by_key(|e| e.timestamp);
        Self { events }
    }

    fn insert(&mut self, event: RawEvent) {
        let at = self
            .events
            .partition_point(|e| e.timestamp <= event.timestamp);
        self.events.insert(at, event);
    }

    fn between(&self, kind: EventKind, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<RawEvent> {
        let lo = self.events.partition_point(|e| e.timestamp < start);
        let hi = self.events.partition_point(|e| e.timestamp < end);
        if lo >= hi {
            return Vec::new();
        }
        self.events[lo..hi]
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.events.first()?.timestamp, self.events.last()?.timestamp))
    }
}

fn poisoned() -> AnalyticsError {
    AnalyticsError::SourceUnavailable("event snapshot lock poisoned".to_string())
}

// ── MemoryEventSource ─────────────────────────────────────────────────────────

/// In-process event source. New events may be pushed at any time, which is
/// how late arrivals are modelled.
#[derive(Debug, Default)]
pub struct MemoryEventSource {
    snapshot: RwLock<Snapshot>,
}

impl MemoryEventSource {
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::new(events)),
        }
    }

    /// Append one event, keeping timestamp order.
    pub fn push(&self, event: RawEvent) -> Result<()> {
        self.snapshot.write().map_err(|_| poisoned())?.insert(event);
        Ok(())
    }

    /// Remove every event matching `predicate`; returns how many were removed.
    pub fn retract(&self, predicate: impl Fn(&RawEvent) -> bool) -> Result<usize> {
        let mut snap = self.snapshot.write().map_err(|_| poisoned())?;
        let before = snap.events.len();
        snap.events.retain(|e| !predicate(e));
        Ok(before - snap.events.len())
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().map(|s| s.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSource for MemoryEventSource {
    fn events_between(
        &self,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>> {
        Ok(self
            .snapshot
            .read()
            .map_err(|_| poisoned())?
            .between(kind, start, end))
    }

    fn time_span(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        Ok(self.snapshot.read().map_err(|_| poisoned())?.span())
    }
}

// ── JsonlEventSource ──────────────────────────────────────────────────────────

/// Events exported as JSONL files (one [`RawEvent`] per line) anywhere under
/// a root directory.
///
/// Files are read once on [`JsonlEventSource::open`] and again on every
/// [`EventSource::refresh`]. Malformed lines are skipped with a warning; an
/// unreadable file makes the whole source unavailable, since partial data
/// would silently undercount.
#[derive(Debug)]
pub struct JsonlEventSource {
    root: PathBuf,
    snapshot: RwLock<Snapshot>,
}

impl JsonlEventSource {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let snapshot = Snapshot::new(load_events(&root)?);
        Ok(Self {
            root,
            snapshot: RwLock::new(snapshot),
        })
    }
}

impl EventSource for JsonlEventSource {
    fn events_between(
        &self,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>> {
        Ok(self
            .snapshot
            .read()
            .map_err(|_| poisoned())?
            .between(kind, start, end))
    }

    fn time_span(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        Ok(self.snapshot.read().map_err(|_| poisoned())?.span())
    }

    fn refresh(&self) -> Result<()> {
        let fresh = Snapshot::new(load_events(&self.root)?);
        *self.snapshot.write().map_err(|_| poisoned())? = fresh;
        Ok(())
    }
}

/// Find all `.jsonl` files recursively under `root`, sorted by path.
pub fn find_jsonl_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .map(|ext| ext == "jsonl")
                    .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}

fn load_events(root: &Path) -> Result<Vec<RawEvent>> {
    if !root.is_dir() {
        return Err(AnalyticsError::SourceUnavailable(format!(
            "event directory not found: {}",
            root.display()
        )));
    }

    let files = find_jsonl_files(root);
    if files.is_empty() {
        warn!("No JSONL files found in {}", root.display());
    }

    let mut events = Vec::new();
    for path in &files {
        let file = std::fs::File::open(path).map_err(|e| {
            AnalyticsError::SourceUnavailable(format!("{}: {e}", path.display()))
        })?;

        let mut skipped = 0usize;
        for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                AnalyticsError::SourceUnavailable(format!("{}: {e}", path.display()))
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawEvent>(trimmed) {
                Ok(event) => events.push(event),
                Err(e) => {
                    skipped += 1;
                    debug!("{}:{}: skipping malformed event: {}", path.display(), line_no + 1, e);
                }
            }
        }
        if skipped > 0 {
            warn!("Skipped {} malformed lines in {}", skipped, path.display());
        }
    }

    debug!("Loaded {} events from {} files", events.len(), files.len());
    Ok(events)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn event(kind: EventKind, h: u32, blog: u64) -> RawEvent {
        RawEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap(),
            kind,
            blog_id: blog,
            author_id: 1,
            country: None,
            user_id: None,
        }
    }

    #[test]
    fn test_memory_between_is_half_open_and_kind_filtered() {
        let src = MemoryEventSource::new(vec![
            event(EventKind::View, 3, 1),
            event(EventKind::View, 1, 1),
            event(EventKind::Creation, 1, 1),
            event(EventKind::View, 2, 1),
        ]);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();

        let views = src.events_between(EventKind::View, start, end).unwrap();
        assert_eq!(views.len(), 2);
        assert!(views[0].timestamp <= views[1].timestamp);

        let creations = src.events_between(EventKind::Creation, start, end).unwrap();
        assert_eq!(creations.len(), 1);
    }

    #[test]
    fn test_memory_push_keeps_order_and_span() {
        let src = MemoryEventSource::new(vec![event(EventKind::View, 5, 1)]);
        src.push(event(EventKind::View, 2, 1)).unwrap();
        src.push(event(EventKind::Creation, 9, 1)).unwrap();

        let (min, max) = src.time_span().unwrap().unwrap();
        assert_eq!(min, Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap());
        assert_eq!(max, Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        assert_eq!(src.len(), 3);
    }

    #[test]
    fn test_memory_retract() {
        let src = MemoryEventSource::new(vec![
            event(EventKind::View, 1, 1),
            event(EventKind::View, 2, 2),
        ]);
        assert_eq!(src.retract(|e| e.blog_id == 2).unwrap(), 1);
        assert_eq!(src.len(), 1);
    }

    #[test]
    fn test_empty_source_has_no_span() {
        let src = MemoryEventSource::default();
        assert!(src.time_span().unwrap().is_none());
        assert!(src.is_empty());
    }

    #[test]
    fn test_jsonl_loads_nested_files_and_skips_bad_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("2024").join("01");
        std::fs::create_dir_all(&nested).unwrap();

        let mut f = std::fs::File::create(nested.join("views.jsonl")).unwrap();
        writeln!(
            f,
            r#"{{"timestamp":"2024-01-01T10:00:00Z","kind":"view","blog_id":1,"author_id":2,"country":"US","user_id":9}}"#
        )
        .unwrap();
        writeln!(f).unwrap();
        writeln!(f, "not json").unwrap();
        writeln!(
            f,
            r#"{{"timestamp":"2024-01-01T11:00:00Z","kind":"creation","blog_id":3,"author_id":2}}"#
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "{}").unwrap();

        let src = JsonlEventSource::open(dir.path()).unwrap();
        let all_day = (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        );
        let views = src.events_between(EventKind::View, all_day.0, all_day.1).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].user_id, Some(9));
        let creations = src
            .events_between(EventKind::Creation, all_day.0, all_day.1)
            .unwrap();
        assert_eq!(creations.len(), 1);
    }

    #[test]
    fn test_jsonl_refresh_sees_new_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = JsonlEventSource::open(dir.path()).unwrap();
        assert!(src.time_span().unwrap().is_none());

        std::fs::write(
            dir.path().join("late.jsonl"),
            r#"{"timestamp":"2024-02-01T00:30:00Z","kind":"view","blog_id":1,"author_id":1}"#,
        )
        .unwrap();
        src.refresh().unwrap();
        assert!(src.time_span().unwrap().is_some());
    }

    #[test]
    fn test_jsonl_missing_root_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = JsonlEventSource::open(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, AnalyticsError::SourceUnavailable(_)));
    }

    #[test]
    fn test_find_jsonl_files_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.jsonl"), "").unwrap();
        std::fs::write(dir.path().join("a.jsonl"), "").unwrap();
        let files = find_jsonl_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.jsonl"));
    }
}
