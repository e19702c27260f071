//! Query routing over stored aggregates.
//!
//! Picks the granularity for a requested span, reads the records answering the
//! dimension filter, fills empty buckets with zeros and computes
//! period-over-period growth. Filters the configured breakdown never stored
//! are rejected rather than read as empty.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use analytics_core::bucketing::{buckets_between, TimeBucket};
use analytics_core::error::{AnalyticsError, Result};
use analytics_core::models::{
    AggregateRecord, BreakdownPolicy, Dimension, DimensionSet, Granularity, MetricKind,
};
use chrono::{DateTime, Duration, Utc, Weekday};
use serde::Serialize;
use tracing::debug;

use crate::store::AggregateStore;

/// Rows returned by [`QueryRouter::top`] when the caller has no preference.
pub const DEFAULT_TOP_LIMIT: usize = 10;

// ── Granularity selection & growth ────────────────────────────────────────────

/// Granularity for a query over `[start, end)`.
///
/// Under 2 days reads hours, under 90 days days, under 730 days months and
/// anything longer years. An explicit `compare` unit always wins.
pub fn select_granularity(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    compare: Option<Granularity>,
) -> Result<Granularity> {
    if end <= start {
        return Err(AnalyticsError::InvalidRange { start, end });
    }
    if let Some(unit) = compare {
        return Ok(unit);
    }
    let span = end - start;
    Ok(if span < Duration::days(2) {
        Granularity::Hour
    } else if span < Duration::days(90) {
        Granularity::Day
    } else if span < Duration::days(730) {
        Granularity::Month
    } else {
        Granularity::Year
    })
}

/// Percentage change from `prev` to `current`, rounded to two decimals.
///
/// `None` for the first bucket of a series and whenever `prev` is zero.
pub fn growth_pct(current: u64, prev: Option<u64>) -> Option<f64> {
    let prev = prev.filter(|p| *p > 0)? as f64;
    let pct = (current as f64 - prev) / prev * 100.0;
    Some((pct * 100.0).round() / 100.0)
}

/// Parse `DIMENSION=VALUE` filter strings into one dimension set.
pub fn parse_filters(filters: &[String]) -> Result<DimensionSet> {
    let pairs = filters
        .iter()
        .map(|f| {
            f.split_once('=')
                .ok_or_else(|| AnalyticsError::UnknownDimension(f.clone()))
        })
        .collect::<Result<Vec<_>>>()?;
    DimensionSet::from_pairs(pairs)
}

// ── Requests & points ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub kind: MetricKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub compare_unit: Option<Granularity>,
    /// "all" means no filtering.
    pub filter: DimensionSet,
}

impl QueryRequest {
    pub fn new(kind: MetricKind, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            kind,
            start,
            end,
            compare_unit: None,
            filter: DimensionSet::all(),
        }
    }

    pub fn with_compare_unit(mut self, unit: Granularity) -> Self {
        self.compare_unit = Some(unit);
        self
    }

    pub fn with_filter(mut self, filter: DimensionSet) -> Self {
        self.filter = filter;
        self
    }
}

/// One bucket of a query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub granularity: Granularity,
    pub label: String,
    pub value: u64,
    pub unique_viewers: Option<u64>,
    pub unique_blogs: Option<u64>,
    pub growth_pct: Option<f64>,
}

/// Chart-ready point, serialized as `{"x": .., "y": .., "z": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint<Z> {
    pub x: String,
    pub y: u64,
    pub z: Z,
}

/// One ranked value of a dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopEntry {
    /// The dimension value.
    pub x: String,
    /// Blog id when ranking blogs, otherwise distinct blogs under the value.
    pub y: Option<u64>,
    /// Total count over the range.
    pub z: u64,
}

// ── Read plans ────────────────────────────────────────────────────────────────

/// How a filter is answered from stored records.
#[derive(Debug, Clone, Copy)]
enum ReadPlan {
    /// The filter is itself a stored dimension set.
    Exact,
    /// Sum the stored full tuples the filter covers.
    SumTuples,
}

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    count: u64,
    unique_viewers: Option<u64>,
    unique_blogs: Option<u64>,
}

impl From<&AggregateRecord> for Cell {
    fn from(r: &AggregateRecord) -> Self {
        Self {
            count: r.count,
            unique_viewers: r.unique_viewers,
            unique_blogs: r.unique_blogs,
        }
    }
}

fn unsupported(filter: &DimensionSet, reason: &str) -> AnalyticsError {
    AnalyticsError::UnsupportedFilter {
        filter: filter.to_string(),
        reason: reason.to_string(),
    }
}

/// Full-tuple rows as the `full` breakdown writes them. Creations carry no
/// blog, so their tuple is (country, author).
fn is_full_tuple(kind: MetricKind, dims: &DimensionSet) -> bool {
    match kind {
        MetricKind::Views => dims.blog.is_some() && dims.author.is_some(),
        MetricKind::Creations => dims.country.is_some() && dims.author.is_some(),
    }
}

// ── QueryRouter ───────────────────────────────────────────────────────────────

/// Read path over an [`AggregateStore`].
pub struct QueryRouter {
    store: Arc<dyn AggregateStore>,
    week_start: Weekday,
    breakdown: BreakdownPolicy,
}

impl QueryRouter {
    /// `breakdown` must be the policy the aggregates were written with.
    pub fn new(
        store: Arc<dyn AggregateStore>,
        week_start: Weekday,
        breakdown: BreakdownPolicy,
    ) -> Self {
        Self {
            store,
            week_start,
            breakdown,
        }
    }

    fn plan(&self, kind: MetricKind, filter: &DimensionSet) -> Result<ReadPlan> {
        if filter.is_all() {
            return Ok(ReadPlan::Exact);
        }
        if kind == MetricKind::Creations && filter.blog.is_some() {
            return Err(unsupported(filter, "creations are not broken down per blog"));
        }
        match (self.breakdown, filter.arity()) {
            (BreakdownPolicy::Totals, _) => Err(unsupported(
                filter,
                "the totals breakdown stores no per-dimension records",
            )),
            (_, 1) => Ok(ReadPlan::Exact),
            (BreakdownPolicy::Full, _) => Ok(ReadPlan::SumTuples),
            (BreakdownPolicy::Single, _) => Err(unsupported(
                filter,
                "the single breakdown stores one dimension per record; use the full breakdown",
            )),
        }
    }

    /// Stored cells answering `filter`, keyed by bucket start.
    fn read_cells(
        &self,
        kind: MetricKind,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &DimensionSet,
    ) -> Result<HashMap<DateTime<Utc>, Cell>> {
        match self.plan(kind, filter)? {
            ReadPlan::Exact => Ok(self
                .store
                .fetch(kind, granularity, start, end, Some(filter))?
                .iter()
                .map(|r| (r.key.bucket_start, Cell::from(r)))
                .collect()),
            ReadPlan::SumTuples => {
                let mut cells: HashMap<DateTime<Utc>, Cell> = HashMap::new();
                for r in self.store.fetch(kind, granularity, start, end, None)? {
                    let dims = &r.key.dimensions;
                    if is_full_tuple(kind, dims) && filter.covers(dims) {
                        // Distinct counts do not add up across tuples.
                        cells.entry(r.key.bucket_start).or_default().count += r.count;
                    }
                }
                Ok(cells)
            }
        }
    }

    /// One point per bucket of the selected granularity in the range, oldest
    /// first. Buckets without a stored record read as zero.
    pub fn query(&self, request: &QueryRequest) -> Result<Vec<SeriesPoint>> {
        let granularity = select_granularity(request.start, request.end, request.compare_unit)?;
        let buckets: Vec<TimeBucket> =
            buckets_between(granularity, request.start, request.end, self.week_start).collect();
        let (Some(first), Some(last)) = (buckets.first(), buckets.last()) else {
            return Ok(Vec::new());
        };

        let stored = self.read_cells(
            request.kind,
            granularity,
            first.start,
            last.end,
            &request.filter,
        )?;

        debug!(
            kind = %request.kind,
            granularity = %granularity,
            filter = %request.filter,
            buckets = buckets.len(),
            stored = stored.len(),
            "query routed"
        );

        let mut prev = None;
        Ok(buckets
            .iter()
            .map(|bucket| {
                let cell = stored.get(&bucket.start).copied().unwrap_or_default();
                let point = SeriesPoint {
                    bucket_start: bucket.start,
                    granularity,
                    label: bucket.label(),
                    value: cell.count,
                    unique_viewers: cell.unique_viewers,
                    unique_blogs: cell.unique_blogs,
                    growth_pct: growth_pct(cell.count, prev),
                };
                prev = Some(cell.count);
                point
            })
            .collect())
    }

    /// `x` = bucket label, `y` = count, `z` = distinct blogs viewed.
    pub fn time_series(&self, request: &QueryRequest) -> Result<Vec<ChartPoint<Option<u64>>>> {
        Ok(self
            .query(request)?
            .into_iter()
            .map(|p| ChartPoint {
                x: p.label,
                y: p.value,
                z: p.unique_blogs,
            })
            .collect())
    }

    /// Views per bucket against blogs created in the same bucket:
    /// `x` = `"<label> (<n> blogs)"`, `y` = views, `z` = view growth.
    ///
    /// Creations carry no per-blog breakdown, so a blog filter is dropped
    /// for the creation counts.
    pub fn performance(&self, request: &QueryRequest) -> Result<Vec<ChartPoint<Option<f64>>>> {
        let granularity = select_granularity(request.start, request.end, request.compare_unit)?;
        let views = self.query(&QueryRequest {
            kind: MetricKind::Views,
            compare_unit: Some(granularity),
            ..request.clone()
        })?;
        let creations = self.query(&QueryRequest {
            kind: MetricKind::Creations,
            compare_unit: Some(granularity),
            filter: DimensionSet {
                blog: None,
                ..request.filter.clone()
            },
            ..request.clone()
        })?;

        Ok(views
            .into_iter()
            .zip(creations)
            .map(|(v, c)| ChartPoint {
                x: format!("{} ({} blogs)", v.label, c.value),
                y: v.value,
                z: v.growth_pct,
            })
            .collect())
    }

    /// Values of `dimension` ranked by total count over the request range,
    /// highest first, ties by value. Keeps at most `limit` rows.
    ///
    /// With the "all" filter the single-dimension records are summed; any
    /// other filter needs the `full` breakdown and sums the covered tuples.
    pub fn top(
        &self,
        request: &QueryRequest,
        dimension: Dimension,
        limit: usize,
    ) -> Result<Vec<TopEntry>> {
        let kind = request.kind;
        if kind == MetricKind::Creations && dimension == Dimension::Blog {
            return Err(unsupported(
                &request.filter,
                "creations are not broken down per blog",
            ));
        }
        if self.breakdown == BreakdownPolicy::Totals {
            return Err(unsupported(
                &request.filter,
                "the totals breakdown stores no per-dimension records",
            ));
        }
        self.plan(kind, &request.filter)?;
        let by_tuples = !request.filter.is_all();
        if by_tuples && self.breakdown != BreakdownPolicy::Full {
            return Err(unsupported(
                &request.filter,
                "ranking under a filter needs the full breakdown",
            ));
        }

        let granularity = select_granularity(request.start, request.end, request.compare_unit)?;
        let buckets: Vec<TimeBucket> =
            buckets_between(granularity, request.start, request.end, self.week_start).collect();
        let (Some(first), Some(last)) = (buckets.first(), buckets.last()) else {
            return Ok(Vec::new());
        };
        let rows = self.store.fetch(kind, granularity, first.start, last.end, None)?;

        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        let mut blogs: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
        for r in &rows {
            let dims = &r.key.dimensions;
            let Some(value) = dims.value_of(dimension) else {
                continue;
            };
            let tuple = is_full_tuple(kind, dims);
            let counted = if by_tuples {
                tuple && request.filter.covers(dims)
            } else {
                dims.arity() == 1
            };
            if counted {
                *totals.entry(value.clone()).or_default() += r.count;
            }
            if tuple && r.count > 0 && request.filter.covers(dims) {
                if let Some(blog) = dims.blog {
                    blogs.entry(value).or_default().insert(blog);
                }
            }
        }

        let blogs_known = self.breakdown == BreakdownPolicy::Full && kind == MetricKind::Views;
        let mut entries: Vec<TopEntry> = totals
            .into_iter()
            .filter(|(_, z)| *z > 0)
            .map(|(x, z)| {
                let y = match dimension {
                    Dimension::Blog => x.parse().ok(),
                    _ if blogs_known => Some(blogs.get(&x).map_or(0, |b| b.len() as u64)),
                    _ => None,
                };
                TopEntry { x, y, z }
            })
            .collect();
        entries.sort_by(|a, b| b.z.cmp(&a.z).then_with(|| a.x.cmp(&b.x)));
        entries.truncate(limit);

        debug!(
            kind = %kind,
            granularity = %granularity,
            dimension = dimension.as_str(),
            filter = %request.filter,
            rows = entries.len(),
            "top routed"
        );
        Ok(entries)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
