//! The aggregation engine: turns raw events into per-bucket aggregate records.
//!
//! Every bucket of the requested window is an independent unit of work. Its
//! records are computed either from raw events or, when the finer granularity
//! was already written over a window covering the bucket, by summing the finer
//! records. Records are upserted one at a time, so re-running a window is
//! always safe and converges on the same stored state.
//!
//! Sets already stored for a bucket are recomputed with it, whatever run wrote
//! them, so switching the breakdown policy never leaves a wrong count behind.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use analytics_core::bucketing::{buckets_between, TimeBucket};
use analytics_core::error::{AnalyticsError, Result};
use analytics_core::models::{
    AggregateKey, AggregateRecord, BreakdownPolicy, DimensionSet, Granularity, MetricKind,
    RawEvent,
};
use analytics_core::settings::EngineConfig;
use chrono::{DateTime, Utc, Weekday};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::source::EventSource;
use crate::store::{AggregateStore, UpsertOutcome};

// ── Options & requests ────────────────────────────────────────────────────────

/// Engine-wide knobs, usually taken from [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationOptions {
    pub week_start: Weekday,
    pub breakdown: BreakdownPolicy,
    /// Extra attempts for an upsert that failed with `WriteConflict`.
    pub write_retries: u32,
    /// Count distinct signed-in viewers and distinct blogs for view
    /// aggregates.
    pub track_unique_viewers: bool,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for AggregationOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            week_start: config.week_start,
            breakdown: config.breakdown,
            write_retries: config.write_retries,
            track_unique_viewers: config.track_unique_viewers,
        }
    }
}

/// One aggregation run over `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRequest {
    pub kind: MetricKind,
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Compute exactly these sets (plus "all") instead of the breakdown policy.
    pub dimension_sets: Option<Vec<DimensionSet>>,
    /// Window over which the finer granularity is known to be fully written.
    pub finer_coverage: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl AggregationRequest {
    pub fn new(
        kind: MetricKind,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            granularity,
            start,
            end,
            dimension_sets: None,
            finer_coverage: None,
        }
    }

    /// A request covering exactly one bucket.
    pub fn for_bucket(kind: MetricKind, bucket: TimeBucket) -> Self {
        Self::new(kind, bucket.granularity, bucket.start, bucket.end)
    }

    pub fn with_dimension_sets(mut self, sets: Vec<DimensionSet>) -> Self {
        self.dimension_sets = Some(sets);
        self
    }

    pub fn with_finer_coverage(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.finer_coverage = Some((start, end));
        self
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// A bucket that could not be aggregated.
#[derive(Debug, Clone, Serialize)]
pub struct BucketFailure {
    pub bucket_start: DateTime<Utc>,
    pub error: String,
}

/// Outcome of one [`AggregationEngine::aggregate`] call.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationReport {
    pub kind: MetricKind,
    pub granularity: Granularity,
    /// Buckets whose records were all written.
    pub buckets_processed: usize,
    pub records_written: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Buckets computed by summing finer records.
    pub from_finer: usize,
    pub failures: Vec<BucketFailure>,
    pub cancelled: bool,
    /// `[first bucket start, last bucket end)` of the enumerated buckets.
    pub span: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl AggregationReport {
    fn empty(kind: MetricKind, granularity: Granularity) -> Self {
        Self {
            kind,
            granularity,
            buckets_processed: 0,
            records_written: 0,
            inserted: 0,
            updated: 0,
            from_finer: 0,
            failures: Vec::new(),
            cancelled: false,
            span: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// The window this run fully wrote, usable as finer coverage for the next
    /// coarser granularity. `None` after any failure or cancellation.
    pub fn clean_coverage(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if self.is_clean() {
            self.span
        } else {
            None
        }
    }
}

/// Reported after every bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationProgress {
    pub granularity: Granularity,
    pub done: usize,
    pub total: usize,
}

// ── Tallies ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Tally {
    count: u64,
    viewers: HashSet<u64>,
    blogs: HashSet<u64>,
}

/// Per-bucket result before it is written.
struct BucketTotals {
    counts: BTreeMap<DimensionSet, Tally>,
    unique: bool,
    from_finer: bool,
}

#[derive(Default)]
struct BucketWrite {
    records: usize,
    inserted: usize,
    updated: usize,
}

// ── AggregationEngine ─────────────────────────────────────────────────────────

/// Computes and persists aggregates for one metric kind and granularity at a
/// time.
pub struct AggregationEngine {
    source: Arc<dyn EventSource>,
    store: Arc<dyn AggregateStore>,
    options: AggregationOptions,
}

impl AggregationEngine {
    pub fn new(
        source: Arc<dyn EventSource>,
        store: Arc<dyn AggregateStore>,
        options: AggregationOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
        }
    }

    pub fn options(&self) -> &AggregationOptions {
        &self.options
    }

    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// Aggregate every bucket intersecting the request window.
    pub fn aggregate(&self, request: &AggregationRequest) -> Result<AggregationReport> {
        let never = AtomicBool::new(false);
        self.aggregate_with(request, &never, |_| {})
    }

    /// [`aggregate`](Self::aggregate) with cooperative cancellation, checked
    /// between buckets, and a callback after each bucket.
    pub fn aggregate_with(
        &self,
        request: &AggregationRequest,
        cancel: &AtomicBool,
        mut on_progress: impl FnMut(AggregationProgress),
    ) -> Result<AggregationReport> {
        if request.end <= request.start {
            return Err(AnalyticsError::InvalidRange {
                start: request.start,
                end: request.end,
            });
        }

        let buckets: Vec<TimeBucket> = buckets_between(
            request.granularity,
            request.start,
            request.end,
            self.options.week_start,
        )
        .collect();

        let mut report = AggregationReport::empty(request.kind, request.granularity);
        report.span = buckets
            .first()
            .zip(buckets.last())
            .map(|(first, last)| (first.start, last.end));

        debug!(
            kind = %request.kind,
            granularity = %request.granularity,
            buckets = buckets.len(),
            "aggregating window"
        );

        let total = buckets.len();
        for (done, bucket) in buckets.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                info!(
                    granularity = %request.granularity,
                    done,
                    total,
                    "aggregation cancelled"
                );
                report.cancelled = true;
                break;
            }

            match self.process_bucket(request, bucket) {
                Ok((write, from_finer)) => {
                    report.buckets_processed += 1;
                    report.records_written += write.records;
                    report.inserted += write.inserted;
                    report.updated += write.updated;
                    if from_finer {
                        report.from_finer += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        kind = %request.kind,
                        granularity = %request.granularity,
                        bucket = %bucket.start,
                        "bucket aggregation failed: {e}"
                    );
                    report.failures.push(BucketFailure {
                        bucket_start: bucket.start,
                        error: e.to_string(),
                    });
                }
            }

            on_progress(AggregationProgress {
                granularity: request.granularity,
                done: done + 1,
                total,
            });
        }

        Ok(report)
    }

    fn process_bucket(
        &self,
        request: &AggregationRequest,
        bucket: &TimeBucket,
    ) -> Result<(BucketWrite, bool)> {
        let stored = self.stored_sets(request, bucket)?;

        let mut finer = None;
        if self.can_use_finer(request, bucket) {
            let totals = self.totals_from_finer(request.kind, bucket)?;
            if stored.iter().all(|set| totals.counts.contains_key(set)) {
                finer = Some(totals);
            } else {
                debug!(
                    bucket = %bucket.label(),
                    "stored sets missing from finer rows; reading raw events"
                );
            }
        }
        let totals = match finer {
            Some(totals) => totals,
            None => self.totals_from_events(request, bucket, &stored)?,
        };
        let from_finer = totals.from_finer;
        let write = self.write_bucket(request, bucket, totals)?;
        debug!(
            granularity = %bucket.granularity,
            bucket = %bucket.label(),
            records = write.records,
            from_finer,
            "bucket written"
        );
        Ok((write, from_finer))
    }

    /// Summing finer rows is exact only for additive counts over a window the
    /// finer pass fully wrote with the same breakdown.
    fn can_use_finer(&self, request: &AggregationRequest, bucket: &TimeBucket) -> bool {
        let Some((cov_start, cov_end)) = request.finer_coverage else {
            return false;
        };
        request.granularity.finer().is_some()
            && request.dimension_sets.is_none()
            && bucket.within(cov_start, cov_end)
            && !(request.kind == MetricKind::Views && self.options.track_unique_viewers)
    }

    /// Dimension sets already stored for the bucket. Explicit-set runs only
    /// touch the sets they name.
    fn stored_sets(
        &self,
        request: &AggregationRequest,
        bucket: &TimeBucket,
    ) -> Result<BTreeSet<DimensionSet>> {
        if request.dimension_sets.is_some() {
            return Ok(BTreeSet::new());
        }
        Ok(self
            .store
            .fetch(request.kind, request.granularity, bucket.start, bucket.end, None)?
            .into_iter()
            .map(|row| row.key.dimensions)
            .collect())
    }

    fn totals_from_finer(&self, kind: MetricKind, bucket: &TimeBucket) -> Result<BucketTotals> {
        let finer = bucket
            .granularity
            .finer()
            .ok_or_else(|| AnalyticsError::InvalidGranularity(bucket.granularity.to_string()))?;
        let rows = self
            .store
            .fetch(kind, finer, bucket.start, bucket.end, None)
            .map_err(|e| AnalyticsError::SourceUnavailable(format!("{finer} aggregates: {e}")))?;

        let mut counts: BTreeMap<DimensionSet, Tally> = BTreeMap::new();
        counts.entry(DimensionSet::all()).or_default();
        for row in rows {
            counts.entry(row.key.dimensions).or_default().count += row.count;
        }
        Ok(BucketTotals {
            counts,
            unique: false,
            from_finer: true,
        })
    }

    fn totals_from_events(
        &self,
        request: &AggregationRequest,
        bucket: &TimeBucket,
        stored: &BTreeSet<DimensionSet>,
    ) -> Result<BucketTotals> {
        let events = self
            .source
            .events_between(request.kind.event_kind(), bucket.start, bucket.end)
            .map_err(|e| match e {
                e @ AnalyticsError::SourceUnavailable(_) => e,
                other => AnalyticsError::SourceUnavailable(other.to_string()),
            })?;
        let unique = request.kind == MetricKind::Views && self.options.track_unique_viewers;

        let mut counts: BTreeMap<DimensionSet, Tally> = BTreeMap::new();
        match &request.dimension_sets {
            Some(sets) => {
                let wanted: BTreeSet<DimensionSet> = sets
                    .iter()
                    .cloned()
                    .chain(iter::once(DimensionSet::all()))
                    .collect();
                for set in wanted {
                    let tally = counts.entry(set.clone()).or_default();
                    for event in events.iter().filter(|e| set.matches(e)) {
                        add_event(tally, event, unique);
                    }
                }
            }
            None => {
                counts.entry(DimensionSet::all()).or_default();
                for event in &events {
                    let own = event_dimensions(request.kind, event);
                    for set in self.options.breakdown.dimension_sets(iter::once(&own)) {
                        add_event(counts.entry(set).or_default(), event, unique);
                    }
                }
            }
        }

        // Sets the policy did not produce this time keep their true count,
        // which is zero once no event matches them.
        for set in stored {
            if counts.contains_key(set) {
                continue;
            }
            let tally = counts.entry(set.clone()).or_default();
            for event in events.iter().filter(|e| set.matches(e)) {
                add_event(tally, event, unique);
            }
        }

        Ok(BucketTotals {
            counts,
            unique,
            from_finer: false,
        })
    }

    fn write_bucket(
        &self,
        request: &AggregationRequest,
        bucket: &TimeBucket,
        totals: BucketTotals,
    ) -> Result<BucketWrite> {
        let now = Utc::now();
        let mut write = BucketWrite::default();
        for (dimensions, tally) in totals.counts {
            let record = AggregateRecord {
                key: AggregateKey {
                    kind: request.kind,
                    granularity: request.granularity,
                    bucket_start: bucket.start,
                    dimensions,
                },
                count: tally.count,
                unique_viewers: totals.unique.then_some(tally.viewers.len() as u64),
                unique_blogs: totals.unique.then_some(tally.blogs.len() as u64),
                updated_at: now,
            };
            match self.upsert_with_retry(record)? {
                UpsertOutcome::Inserted => write.inserted += 1,
                UpsertOutcome::Updated => write.updated += 1,
            }
            write.records += 1;
        }
        Ok(write)
    }

    fn upsert_with_retry(&self, record: AggregateRecord) -> Result<UpsertOutcome> {
        let max_attempts = self.options.write_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.store.upsert(record.clone()) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    debug!(key = %record.key, attempt, "retrying upsert: {e}");
                    attempt += 1;
                }
                Err(AnalyticsError::WriteConflict { key, .. }) => {
                    return Err(AnalyticsError::WriteConflict {
                        key,
                        attempts: attempt,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Breakdown source for an event. Creation aggregates are not broken down
/// per blog: every creation is its own blog.
fn event_dimensions(kind: MetricKind, event: &RawEvent) -> DimensionSet {
    let mut dims = event.dimensions();
    if kind == MetricKind::Creations {
        dims.blog = None;
    }
    dims
}

fn add_event(tally: &mut Tally, event: &RawEvent, unique: bool) {
    tally.count += 1;
    if unique {
        tally.blogs.insert(event.blog_id);
        if let Some(user) = event.user_id {
            tally.viewers.insert(user);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryEventSource;
    use crate::sqlite::SqliteStore;
    use crate::store::MemoryStore;
    use analytics_core::models::{Dimension, EventKind};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::AtomicU32;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    fn view(ts: DateTime<Utc>, blog: u64, author: u64, country: &str, user: Option<u64>) -> RawEvent {
        RawEvent {
            timestamp: ts,
            kind: EventKind::View,
            blog_id: blog,
            author_id: author,
            country: Some(country.to_string()),
            user_id: user,
        }
    }

    fn creation(ts: DateTime<Utc>, blog: u64, author: u64) -> RawEvent {
        RawEvent {
            timestamp: ts,
            kind: EventKind::Creation,
            blog_id: blog,
            author_id: author,
            country: Some("US".to_string()),
            user_id: None,
        }
    }

    fn sample_views() -> Vec<RawEvent> {
        vec![
            view(at(1, 1) + Duration::minutes(5), 1, 10, "US", Some(100)),
            view(at(1, 1) + Duration::minutes(40), 1, 10, "US", Some(100)),
            view(at(1, 3), 2, 20, "DE", Some(101)),
            view(at(1, 23) + Duration::minutes(59), 2, 20, "DE", None),
            view(at(2, 0), 1, 10, "FR", Some(102)),
            view(at(3, 12), 3, 10, "US", Some(103)),
        ]
    }

    fn engine_with(
        events: Vec<RawEvent>,
        options: AggregationOptions,
    ) -> (Arc<MemoryEventSource>, Arc<MemoryStore>, AggregationEngine) {
        let source = Arc::new(MemoryEventSource::new(events));
        let store = Arc::new(MemoryStore::new());
        let engine = AggregationEngine::new(source.clone(), store.clone(), options);
        (source, store, engine)
    }

    fn count_of(
        store: &MemoryStore,
        kind: MetricKind,
        g: Granularity,
        start: DateTime<Utc>,
        dims: DimensionSet,
    ) -> Option<u64> {
        store
            .get(&AggregateKey {
                kind,
                granularity: g,
                bucket_start: start,
                dimensions: dims,
            })
            .unwrap()
            .map(|r| r.count)
    }

    fn counts(store: &MemoryStore) -> Vec<(AggregateKey, u64, Option<u64>)> {
        store
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|r| (r.key, r.count, r.unique_viewers))
            .collect()
    }

    #[test]
    fn test_daily_totals_and_breakdowns() {
        let (_, store, engine) = engine_with(sample_views(), AggregationOptions::default());
        let report = engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Day,
                at(1, 0),
                at(4, 0),
            ))
            .unwrap();

        assert_eq!(report.buckets_processed, 3);
        assert!(report.is_clean());
        assert_eq!(report.span, Some((at(1, 0), at(4, 0))));

        let day = Granularity::Day;
        let v = MetricKind::Views;
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::all()), Some(4));
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::blog(1)), Some(2));
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::author(20)), Some(2));
        assert_eq!(
            count_of(&store, v, day, at(1, 0), DimensionSet::country("de").unwrap()),
            Some(2)
        );
        assert_eq!(count_of(&store, v, day, at(2, 0), DimensionSet::all()), Some(1));
        assert_eq!(count_of(&store, v, day, at(3, 0), DimensionSet::blog(3)), Some(1));
    }

    #[test]
    fn test_empty_bucket_still_writes_zero_total() {
        let (_, store, engine) = engine_with(Vec::new(), AggregationOptions::default());
        let report = engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Hour,
                at(5, 0),
                at(5, 3),
            ))
            .unwrap();
        assert_eq!(report.records_written, 3);
        assert_eq!(
            count_of(&store, MetricKind::Views, Granularity::Hour, at(5, 1), DimensionSet::all()),
            Some(0)
        );
    }

    #[test]
    fn test_unique_viewers_counted_for_views() {
        let (_, store, engine) = engine_with(sample_views(), AggregationOptions::default());
        engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Day,
                at(1, 0),
                at(2, 0),
            ))
            .unwrap();
        let all = store
            .get(&AggregateKey {
                kind: MetricKind::Views,
                granularity: Granularity::Day,
                bucket_start: at(1, 0),
                dimensions: DimensionSet::all(),
            })
            .unwrap()
            .unwrap();
        // users 100 (twice) and 101; the anonymous view is not a distinct viewer
        assert_eq!(all.count, 4);
        assert_eq!(all.unique_viewers, Some(2));
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let (_, store, engine) = engine_with(sample_views(), AggregationOptions::default());
        let request =
            AggregationRequest::new(MetricKind::Views, Granularity::Hour, at(1, 0), at(4, 0));

        let first = engine.aggregate(&request).unwrap();
        let after_first = counts(&store);
        let second = engine.aggregate(&request).unwrap();

        assert_eq!(counts(&store), after_first);
        assert_eq!(first.inserted, first.records_written);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, first.records_written);
    }

    #[test]
    fn test_late_events_and_retractions_are_reflected() {
        let (source, store, engine) = engine_with(sample_views(), AggregationOptions::default());
        let request =
            AggregationRequest::new(MetricKind::Views, Granularity::Day, at(1, 0), at(2, 0));
        engine.aggregate(&request).unwrap();

        source.push(view(at(1, 8), 1, 10, "US", Some(104))).unwrap();
        source.retract(|e| e.blog_id == 2).unwrap();
        engine.aggregate(&request).unwrap();

        let (v, day) = (MetricKind::Views, Granularity::Day);
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::all()), Some(3));
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::blog(1)), Some(3));
        // The vanished breakdown is zeroed, not left stale.
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::blog(2)), Some(0));
        assert_eq!(
            count_of(&store, v, day, at(1, 0), DimensionSet::country("DE").unwrap()),
            Some(0)
        );
    }

    #[test]
    fn test_hour_sums_match_day_via_raw_and_finer_paths() {
        let options = AggregationOptions {
            track_unique_viewers: false,
            ..AggregationOptions::default()
        };
        let (source, store, engine) = engine_with(sample_views(), options);

        let hours =
            AggregationRequest::new(MetricKind::Views, Granularity::Hour, at(1, 0), at(4, 0));
        let hour_report = engine.aggregate(&hours).unwrap();
        let (cov_start, cov_end) = hour_report.clean_coverage().unwrap();

        let day_finer =
            AggregationRequest::new(MetricKind::Views, Granularity::Day, at(1, 0), at(4, 0))
                .with_finer_coverage(cov_start, cov_end);
        let report = engine.aggregate(&day_finer).unwrap();
        assert_eq!(report.from_finer, 3);

        let raw_store = Arc::new(MemoryStore::new());
        let raw_engine = AggregationEngine::new(source, raw_store.clone(), options);
        let raw = raw_engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Day,
                at(1, 0),
                at(4, 0),
            ))
            .unwrap();
        assert_eq!(raw.from_finer, 0);

        for set in [
            DimensionSet::all(),
            DimensionSet::blog(1),
            DimensionSet::blog(2),
            DimensionSet::author(10),
            DimensionSet::country("US").unwrap(),
        ] {
            for d in 1..=3 {
                let hour_sum: u64 = store
                    .fetch(MetricKind::Views, Granularity::Hour, at(d, 0), at(d + 1, 0), Some(&set))
                    .unwrap()
                    .iter()
                    .map(|r| r.count)
                    .sum();
                let via_finer =
                    count_of(&store, MetricKind::Views, Granularity::Day, at(d, 0), set.clone())
                        .unwrap_or(0);
                let via_raw =
                    count_of(&raw_store, MetricKind::Views, Granularity::Day, at(d, 0), set.clone())
                        .unwrap_or(0);
                assert_eq!(hour_sum, via_finer, "finer path {set} day {d}");
                assert_eq!(hour_sum, via_raw, "raw path {set} day {d}");
            }
        }
    }

    #[test]
    fn test_finer_path_skipped_for_distinct_viewers() {
        let (_, _, engine) = engine_with(sample_views(), AggregationOptions::default());
        engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Hour,
                at(1, 0),
                at(2, 0),
            ))
            .unwrap();
        let report = engine
            .aggregate(
                &AggregationRequest::new(MetricKind::Views, Granularity::Day, at(1, 0), at(2, 0))
                    .with_finer_coverage(at(1, 0), at(2, 0)),
            )
            .unwrap();
        assert_eq!(report.from_finer, 0);
    }

    #[test]
    fn test_explicit_dimension_sets() {
        let (_, store, engine) = engine_with(sample_views(), AggregationOptions::default());
        let report = engine
            .aggregate(
                &AggregationRequest::new(MetricKind::Views, Granularity::Day, at(1, 0), at(2, 0))
                    .with_dimension_sets(vec![DimensionSet::blog(2), DimensionSet::blog(9)]),
            )
            .unwrap();
        assert_eq!(report.records_written, 3);
        let (v, day) = (MetricKind::Views, Granularity::Day);
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::blog(2)), Some(2));
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::blog(9)), Some(0));
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::blog(1)), None);
    }

    #[test]
    fn test_creations_skip_blog_breakdown() {
        let events = vec![creation(at(1, 2), 1, 10), creation(at(1, 5), 2, 10)];
        let (_, store, engine) = engine_with(events, AggregationOptions::default());
        engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Creations,
                Granularity::Day,
                at(1, 0),
                at(2, 0),
            ))
            .unwrap();
        let (c, day) = (MetricKind::Creations, Granularity::Day);
        assert_eq!(count_of(&store, c, day, at(1, 0), DimensionSet::all()), Some(2));
        assert_eq!(count_of(&store, c, day, at(1, 0), DimensionSet::author(10)), Some(2));
        assert_eq!(count_of(&store, c, day, at(1, 0), DimensionSet::blog(1)), None);
        let all = store.snapshot().unwrap();
        assert!(all.iter().all(|r| r.unique_viewers.is_none()));
    }

    #[test]
    fn test_invalid_range_rejected() {
        let (_, _, engine) = engine_with(Vec::new(), AggregationOptions::default());
        let err = engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Day,
                at(2, 0),
                at(2, 0),
            ))
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::InvalidRange { .. }));
        assert!(err.is_input_error());
    }

    fn tuple(blog: u64, country: &str, author: u64) -> DimensionSet {
        DimensionSet {
            blog: Some(blog),
            country: Some(country.to_string()),
            author: Some(author),
        }
    }

    #[test]
    fn test_unique_blogs_counted_for_views() {
        let (_, store, engine) = engine_with(sample_views(), AggregationOptions::default());
        engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Day,
                at(1, 0),
                at(2, 0),
            ))
            .unwrap();
        let (v, day) = (MetricKind::Views, Granularity::Day);
        let get = |dims: DimensionSet| {
            store
                .get(&AggregateKey {
                    kind: v,
                    granularity: day,
                    bucket_start: at(1, 0),
                    dimensions: dims,
                })
                .unwrap()
                .unwrap()
        };
        assert_eq!(get(DimensionSet::all()).unique_blogs, Some(2));
        assert_eq!(get(DimensionSet::author(10)).unique_blogs, Some(1));
    }

    #[test]
    fn test_switching_breakdown_keeps_tuple_counts() {
        let events = vec![
            view(at(1, 2), 1, 10, "US", None),
            view(at(1, 5), 1, 10, "US", None),
        ];
        let (source, store, full_engine) = engine_with(
            events,
            AggregationOptions {
                breakdown: BreakdownPolicy::Full,
                ..AggregationOptions::default()
            },
        );
        let single_engine =
            AggregationEngine::new(source, store.clone(), AggregationOptions::default());
        let request =
            AggregationRequest::new(MetricKind::Views, Granularity::Day, at(1, 0), at(2, 0));
        let (v, day) = (MetricKind::Views, Granularity::Day);

        full_engine.aggregate(&request).unwrap();
        assert_eq!(count_of(&store, v, day, at(1, 0), tuple(1, "US", 10)), Some(2));

        single_engine.aggregate(&request).unwrap();
        assert_eq!(count_of(&store, v, day, at(1, 0), tuple(1, "US", 10)), Some(2));
        assert_eq!(count_of(&store, v, day, at(1, 0), DimensionSet::blog(1)), Some(2));
    }

    #[test]
    fn test_explicit_sets_survive_policy_run_and_follow_source() {
        let (source, store, engine) = engine_with(sample_views(), AggregationOptions::default());
        let blog_in_us = DimensionSet::blog(1).with(Dimension::Country, "US").unwrap();
        let day_one =
            AggregationRequest::new(MetricKind::Views, Granularity::Day, at(1, 0), at(2, 0));
        let (v, day) = (MetricKind::Views, Granularity::Day);

        engine
            .aggregate(&day_one.clone().with_dimension_sets(vec![blog_in_us.clone()]))
            .unwrap();
        assert_eq!(count_of(&store, v, day, at(1, 0), blog_in_us.clone()), Some(2));

        engine.aggregate(&day_one).unwrap();
        assert_eq!(count_of(&store, v, day, at(1, 0), blog_in_us.clone()), Some(2));

        source.push(view(at(1, 9), 1, 10, "US", None)).unwrap();
        engine.aggregate(&day_one).unwrap();
        assert_eq!(count_of(&store, v, day, at(1, 0), blog_in_us.clone()), Some(3));

        source.retract(|e| e.blog_id == 1).unwrap();
        engine.aggregate(&day_one).unwrap();
        assert_eq!(count_of(&store, v, day, at(1, 0), blog_in_us), Some(0));
    }

    #[test]
    fn test_stored_sets_missing_from_finer_rows_force_raw_path() {
        let options = AggregationOptions {
            track_unique_viewers: false,
            ..AggregationOptions::default()
        };
        let (source, store, engine) = engine_with(sample_views(), options);
        let full_engine = AggregationEngine::new(
            source,
            store.clone(),
            AggregationOptions {
                breakdown: BreakdownPolicy::Full,
                ..options
            },
        );
        let (v, day) = (MetricKind::Views, Granularity::Day);

        full_engine
            .aggregate(&AggregationRequest::new(v, day, at(1, 0), at(3, 0)))
            .unwrap();
        let hours = engine
            .aggregate(&AggregationRequest::new(v, Granularity::Hour, at(1, 0), at(3, 0)))
            .unwrap();
        let (cov_start, cov_end) = hours.clean_coverage().unwrap();

        let report = engine
            .aggregate(
                &AggregationRequest::new(v, day, at(1, 0), at(3, 0))
                    .with_finer_coverage(cov_start, cov_end),
            )
            .unwrap();
        assert_eq!(report.from_finer, 0);
        assert_eq!(count_of(&store, v, day, at(1, 0), tuple(1, "US", 10)), Some(2));
        assert_eq!(count_of(&store, v, day, at(2, 0), tuple(1, "FR", 10)), Some(1));
    }

    fn rows_by_key(store: &dyn AggregateStore) -> Vec<(AggregateKey, u64, Option<u64>, Option<u64>)> {
        let mut rows: Vec<_> = store
            .fetch(MetricKind::Views, Granularity::Hour, at(1, 0), at(4, 0), None)
            .unwrap()
            .into_iter()
            .map(|r| (r.key, r.count, r.unique_viewers, r.unique_blogs))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    fn overlapping_runs_leave_one_row_per_key(store: Arc<dyn AggregateStore>) {
        let source = Arc::new(MemoryEventSource::new(sample_views()));
        let engine = Arc::new(AggregationEngine::new(
            source.clone(),
            store.clone(),
            AggregationOptions::default(),
        ));
        let windows = [
            (at(1, 0), at(3, 0)),
            (at(2, 0), at(4, 0)),
            (at(1, 0), at(4, 0)),
            (at(1, 12), at(3, 12)),
        ];

        let handles: Vec<_> = windows
            .into_iter()
            .map(|(start, end)| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for _ in 0..3 {
                        let report = engine
                            .aggregate(&AggregationRequest::new(
                                MetricKind::Views,
                                Granularity::Hour,
                                start,
                                end,
                            ))
                            .unwrap();
                        assert!(report.is_clean());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reference = Arc::new(MemoryStore::new());
        AggregationEngine::new(source, reference.clone(), AggregationOptions::default())
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Hour,
                at(1, 0),
                at(4, 0),
            ))
            .unwrap();

        assert_eq!(store.len().unwrap(), reference.len().unwrap());
        assert_eq!(rows_by_key(store.as_ref()), rows_by_key(reference.as_ref()));
    }

    #[test]
    fn test_concurrent_overlapping_aggregations_memory_store() {
        overlapping_runs_leave_one_row_per_key(Arc::new(MemoryStore::new()));
    }

    #[test]
    fn test_concurrent_overlapping_aggregations_sqlite_store() {
        overlapping_runs_leave_one_row_per_key(Arc::new(SqliteStore::open_in_memory().unwrap()));
    }

    // ── Failure handling ──────────────────────────────────────────────────────

    /// Fails the first `failures` upserts with a write conflict.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    impl AggregateStore for FlakyStore {
        fn upsert(&self, record: AggregateRecord) -> Result<UpsertOutcome> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(AnalyticsError::WriteConflict {
                    key: record.key.to_string(),
                    attempts: 1,
                });
            }
            self.inner.upsert(record)
        }

        fn get(&self, key: &AggregateKey) -> Result<Option<AggregateRecord>> {
            self.inner.get(key)
        }

        fn fetch(
            &self,
            kind: MetricKind,
            granularity: Granularity,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            dimensions: Option<&DimensionSet>,
        ) -> Result<Vec<AggregateRecord>> {
            self.inner.fetch(kind, granularity, start, end, dimensions)
        }

        fn clear(
            &self,
            kind: MetricKind,
            granularity: Granularity,
            range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        ) -> Result<usize> {
            self.inner.clear(kind, granularity, range)
        }

        fn len(&self) -> Result<usize> {
            self.inner.len()
        }
    }

    /// Unreadable for one hour of the timeline.
    struct GappySource {
        inner: MemoryEventSource,
        broken: TimeBucket,
    }

    impl EventSource for GappySource {
        fn events_between(
            &self,
            kind: EventKind,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<RawEvent>> {
            if self.broken.start < end && start < self.broken.end {
                return Err(AnalyticsError::Io(std::io::Error::other("disk gone")));
            }
            self.inner.events_between(kind, start, end)
        }

        fn time_span(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
            self.inner.time_span()
        }
    }

    #[test]
    fn test_transient_write_conflicts_are_retried() {
        let source = Arc::new(MemoryEventSource::new(sample_views()));
        let store = Arc::new(FlakyStore::new(2));
        let engine = AggregationEngine::new(source, store.clone(), AggregationOptions::default());
        let report = engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Day,
                at(2, 0),
                at(3, 0),
            ))
            .unwrap();
        assert!(report.is_clean());
        assert!(store.len().unwrap() > 0);
    }

    #[test]
    fn test_exhausted_retries_fail_only_that_bucket() {
        let source = Arc::new(MemoryEventSource::new(sample_views()));
        let store = Arc::new(FlakyStore::new(4));
        let options = AggregationOptions {
            write_retries: 3,
            ..AggregationOptions::default()
        };
        let engine = AggregationEngine::new(source, store.clone(), options);
        let report = engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Day,
                at(2, 0),
                at(4, 0),
            ))
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].bucket_start, at(2, 0));
        assert!(report.failures[0].error.contains("after 4 attempts"));
        assert_eq!(report.buckets_processed, 1);
        assert!(report.clean_coverage().is_none());
    }

    #[test]
    fn test_source_failure_isolated_to_bucket() {
        let broken = analytics_core::bucketing::bucket_for(at(1, 3), Granularity::Hour, Weekday::Mon);
        let source = Arc::new(GappySource {
            inner: MemoryEventSource::new(sample_views()),
            broken,
        });
        let store = Arc::new(MemoryStore::new());
        let engine = AggregationEngine::new(source, store.clone(), AggregationOptions::default());
        let report = engine
            .aggregate(&AggregationRequest::new(
                MetricKind::Views,
                Granularity::Hour,
                at(1, 2),
                at(1, 5),
            ))
            .unwrap();

        assert_eq!(report.buckets_processed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].bucket_start, at(1, 3));
        // Buckets before and after the failure are written.
        assert!(count_of(&store, MetricKind::Views, Granularity::Hour, at(1, 2), DimensionSet::all()).is_some());
        assert!(count_of(&store, MetricKind::Views, Granularity::Hour, at(1, 4), DimensionSet::all()).is_some());
    }

    #[test]
    fn test_cancellation_between_buckets() {
        let (_, store, engine) = engine_with(sample_views(), AggregationOptions::default());
        let cancel = AtomicBool::new(false);
        let mut seen = Vec::new();
        let report = engine
            .aggregate_with(
                &AggregationRequest::new(MetricKind::Views, Granularity::Day, at(1, 0), at(4, 0)),
                &cancel,
                |p| {
                    seen.push(p);
                    cancel.store(true, Ordering::Relaxed);
                },
            )
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.buckets_processed, 1);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].total, 3);
        assert!(store
            .fetch(MetricKind::Views, Granularity::Day, at(2, 0), at(4, 0), None)
            .unwrap()
            .is_empty());
    }
}
