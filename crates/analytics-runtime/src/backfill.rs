//! Backfill orchestrator.
//!
//! Recomputes aggregates for historical ranges, one granularity pass at a
//! time from finest to coarsest so each coarser pass can sum the records the
//! previous pass just wrote. A failing pass is reported and the remaining
//! passes still run.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use analytics_core::error::{AnalyticsError, Result};
use analytics_core::models::{Granularity, MetricKind};
use analytics_core::time_utils::{end_of_day, start_of_day};
use analytics_data::aggregator::{AggregationEngine, AggregationReport, AggregationRequest};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Attempts at refreshing the raw source before a backfill gives up.
const MAX_REFRESH_ATTEMPTS: u32 = 3;

// ── Requests ──────────────────────────────────────────────────────────────────

/// Which granularities a backfill recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GranularitySelection {
    One(Granularity),
    All,
}

impl GranularitySelection {
    /// Selected granularities, finest first.
    pub fn granularities(self) -> Vec<Granularity> {
        match self {
            GranularitySelection::One(g) => vec![g],
            GranularitySelection::All => Granularity::ALL.to_vec(),
        }
    }
}

impl FromStr for GranularitySelection {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(GranularitySelection::All)
        } else {
            s.parse().map(GranularitySelection::One)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillRequest {
    pub granularities: GranularitySelection,
    /// First day to recompute; defaults to the earliest raw event.
    pub start_date: Option<NaiveDate>,
    /// Last day to recompute (inclusive); defaults to the latest raw event.
    pub end_date: Option<NaiveDate>,
    /// Delete existing records of each selected granularity first.
    pub clear: bool,
    pub kinds: Vec<MetricKind>,
}

impl Default for BackfillRequest {
    fn default() -> Self {
        Self {
            granularities: GranularitySelection::All,
            start_date: None,
            end_date: None,
            clear: false,
            kinds: MetricKind::ALL.to_vec(),
        }
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// Result of one kind/granularity pass.
#[derive(Debug, Clone, Serialize)]
pub struct GranularityReport {
    pub kind: MetricKind,
    pub granularity: Granularity,
    pub buckets_written: usize,
    pub buckets_failed: usize,
    pub records_written: usize,
    pub records_cleared: usize,
    pub from_finer: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl GranularityReport {
    fn new(kind: MetricKind, granularity: Granularity) -> Self {
        Self {
            kind,
            granularity,
            buckets_written: 0,
            buckets_failed: 0,
            records_written: 0,
            records_cleared: 0,
            from_finer: 0,
            errors: Vec::new(),
            cancelled: false,
        }
    }

    fn absorb(&mut self, report: &AggregationReport) {
        self.buckets_written = report.buckets_processed;
        self.buckets_failed = report.failures.len();
        self.records_written = report.records_written;
        self.from_finer = report.from_finer;
        self.cancelled = report.cancelled;
        self.errors.extend(
            report
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.bucket_start.to_rfc3339(), f.error)),
        );
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    /// Resolved window; `None` when there was nothing to backfill.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub passes: Vec<GranularityReport>,
    pub cancelled: bool,
}

impl BackfillReport {
    pub fn buckets_written(&self) -> usize {
        self.passes.iter().map(|p| p.buckets_written).sum()
    }

    pub fn buckets_failed(&self) -> usize {
        self.passes.iter().map(|p| p.buckets_failed).sum()
    }

    pub fn records_written(&self) -> usize {
        self.passes.iter().map(|p| p.records_written).sum()
    }

    pub fn records_cleared(&self) -> usize {
        self.passes.iter().map(|p| p.records_cleared).sum()
    }

    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.passes.iter().all(|p| p.errors.is_empty())
    }
}

// ── BackfillOrchestrator ──────────────────────────────────────────────────────

pub struct BackfillOrchestrator {
    engine: Arc<AggregationEngine>,
    cancel: Arc<AtomicBool>,
}

impl BackfillOrchestrator {
    pub fn new(engine: Arc<AggregationEngine>) -> Self {
        Self {
            engine,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops the running backfill after its current bucket.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn backfill(&self, request: &BackfillRequest) -> Result<BackfillReport> {
        if let (Some(start), Some(end)) = (request.start_date, request.end_date) {
            if end < start {
                return Err(AnalyticsError::InvalidRange {
                    start: start_of_day(start),
                    end: start_of_day(end),
                });
            }
        }

        self.refresh_source_with_retry()?;

        let Some((start, end)) = self.resolve_window(request)? else {
            info!("no events and no dates given; nothing to backfill");
            return Ok(BackfillReport::default());
        };

        let granularities = request.granularities.granularities();
        info!(
            start = %start,
            end = %end,
            granularities = ?granularities,
            kinds = ?request.kinds,
            clear = request.clear,
            "starting backfill"
        );

        let dates_given = request.start_date.is_some() || request.end_date.is_some();
        let mut report = BackfillReport {
            window: Some((start, end)),
            ..BackfillReport::default()
        };

        'kinds: for &kind in &request.kinds {
            let mut coverage: HashMap<Granularity, (DateTime<Utc>, DateTime<Utc>)> = HashMap::new();
            for &granularity in &granularities {
                let mut pass = GranularityReport::new(kind, granularity);

                if request.clear {
                    let scope = dates_given.then_some((start, end));
                    match self.engine.store().clear(kind, granularity, scope) {
                        Ok(n) => {
                            info!(kind = %kind, granularity = %granularity, cleared = n, "cleared aggregates");
                            pass.records_cleared = n;
                        }
                        Err(e) => {
                            warn!(kind = %kind, granularity = %granularity, "clear failed: {e}");
                            pass.errors.push(format!("clear: {e}"));
                            report.passes.push(pass);
                            continue;
                        }
                    }
                }

                let mut aggregation = AggregationRequest::new(kind, granularity, start, end);
                if let Some((cov_start, cov_end)) =
                    granularity.finer().and_then(|f| coverage.get(&f)).copied()
                {
                    aggregation = aggregation.with_finer_coverage(cov_start, cov_end);
                }

                match self.engine.aggregate_with(&aggregation, &self.cancel, |p| {
                    let step = (p.total / 10).max(1);
                    if p.done % step == 0 || p.done == p.total {
                        debug!(
                            kind = %kind,
                            granularity = %p.granularity,
                            "backfill progress {}/{}",
                            p.done,
                            p.total
                        );
                    }
                }) {
                    Ok(result) => {
                        if let Some(window) = result.clean_coverage() {
                            coverage.insert(granularity, window);
                        }
                        pass.absorb(&result);
                    }
                    Err(e) => {
                        warn!(kind = %kind, granularity = %granularity, "pass failed: {e}");
                        pass.errors.push(e.to_string());
                    }
                }

                info!(
                    kind = %kind,
                    granularity = %granularity,
                    buckets_written = pass.buckets_written,
                    buckets_failed = pass.buckets_failed,
                    records_written = pass.records_written,
                    "backfill pass finished"
                );

                let cancelled = pass.cancelled;
                report.passes.push(pass);
                if cancelled {
                    report.cancelled = true;
                    break 'kinds;
                }
            }
        }

        info!(
            buckets_written = report.buckets_written(),
            buckets_failed = report.buckets_failed(),
            records_written = report.records_written(),
            cancelled = report.cancelled,
            "backfill finished"
        );
        Ok(report)
    }

    /// `[start, end)` to recompute; dates are whole UTC days and the end date
    /// is inclusive. Missing bounds fall back to the raw source's span.
    fn resolve_window(
        &self,
        request: &BackfillRequest,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let span = if request.start_date.is_none() || request.end_date.is_none() {
            self.engine.source().time_span()?
        } else {
            None
        };

        let start = request
            .start_date
            .map(start_of_day)
            .or_else(|| span.map(|(min, _)| min));
        let end = request.end_date.map(end_of_day).or_else(|| {
            span.map(|(_, max)| max + chrono::Duration::nanoseconds(1))
        });

        match (start, end) {
            (Some(start), Some(end)) if start < end => Ok(Some((start, end))),
            (Some(start), Some(end)) => {
                warn!(start = %start, end = %end, "given dates lie outside the event span");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn refresh_source_with_retry(&self) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..MAX_REFRESH_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(Duration::from_millis(100 * u64::from(attempt)));
            }
            match self.engine.source().refresh() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(attempt = attempt + 1, "source refresh failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            AnalyticsError::SourceUnavailable("source refresh failed".to_string())
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
