//! Periodic aggregation jobs and the tokio scheduler that fires them.
//!
//! Each cadence recomputes the bucket that most recently closed for its
//! granularity. Jobs are plain functions of "now" so they can be run by hand
//! (`aggregate --cadence`) or registered with a [`Scheduler`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use analytics_core::bucketing::{bucket_for, previous_completed, TimeBucket};
use analytics_core::error::{AnalyticsError, Result};
use analytics_core::models::{Granularity, MetricKind};
use analytics_data::aggregator::{AggregationEngine, AggregationReport, AggregationRequest};
use chrono::{DateTime, Utc, Weekday};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ── Cadence ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Cadence {
    pub const ALL: [Cadence; 5] = [
        Cadence::Hourly,
        Cadence::Daily,
        Cadence::Weekly,
        Cadence::Monthly,
        Cadence::Yearly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::Hourly => "hourly",
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
            Cadence::Yearly => "yearly",
        }
    }

    pub fn granularity(self) -> Granularity {
        match self {
            Cadence::Hourly => Granularity::Hour,
            Cadence::Daily => Granularity::Day,
            Cadence::Weekly => Granularity::Week,
            Cadence::Monthly => Granularity::Month,
            Cadence::Yearly => Granularity::Year,
        }
    }

    /// Metric kinds aggregated on this cadence. Creations are too sparse to
    /// be worth hourly or weekly rows.
    pub fn default_kinds(self) -> &'static [MetricKind] {
        match self {
            Cadence::Hourly | Cadence::Weekly => &[MetricKind::Views],
            Cadence::Daily | Cadence::Monthly | Cadence::Yearly => {
                &[MetricKind::Views, MetricKind::Creations]
            }
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if let Some(cadence) = Cadence::ALL.into_iter().find(|c| c.as_str() == s) {
            return Ok(cadence);
        }
        // "hour", "day", ... name the same jobs.
        let granularity: Granularity = s.parse()?;
        Cadence::ALL
            .into_iter()
            .find(|c| c.granularity() == granularity)
            .ok_or_else(|| AnalyticsError::InvalidGranularity(s.clone()))
    }
}

// ── AggregationJobs ───────────────────────────────────────────────────────────

/// Everything one cadence run wrote.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub cadence: Cadence,
    pub bucket: TimeBucket,
    pub reports: Vec<AggregationReport>,
}

impl JobReport {
    pub fn is_clean(&self) -> bool {
        self.reports.iter().all(AggregationReport::is_clean)
    }
}

pub struct AggregationJobs {
    engine: Arc<AggregationEngine>,
}

impl AggregationJobs {
    pub fn new(engine: Arc<AggregationEngine>) -> Self {
        Self { engine }
    }

    /// Recompute the last completed bucket of `cadence` before `now` for each
    /// of the cadence's metric kinds.
    pub fn run(&self, cadence: Cadence, now: DateTime<Utc>) -> Result<JobReport> {
        let bucket = previous_completed(
            cadence.granularity(),
            now,
            self.engine.options().week_start,
        );
        tracing::info!(cadence = %cadence, bucket = %bucket.label(), "running aggregation job");

        let reports = cadence
            .default_kinds()
            .iter()
            .map(|&kind| {
                self.engine
                    .aggregate(&AggregationRequest::for_bucket(kind, bucket))
            })
            .collect::<Result<Vec<_>>>()?;

        for report in reports.iter().filter(|r| !r.is_clean()) {
            tracing::warn!(
                cadence = %cadence,
                kind = %report.kind,
                failures = report.failures.len(),
                "aggregation job finished with failures"
            );
        }
        Ok(JobReport {
            cadence,
            bucket,
            reports,
        })
    }

    pub fn run_hourly(&self, now: DateTime<Utc>) -> Result<JobReport> {
        self.run(Cadence::Hourly, now)
    }

    pub fn run_daily(&self, now: DateTime<Utc>) -> Result<JobReport> {
        self.run(Cadence::Daily, now)
    }

    pub fn run_weekly(&self, now: DateTime<Utc>) -> Result<JobReport> {
        self.run(Cadence::Weekly, now)
    }

    pub fn run_monthly(&self, now: DateTime<Utc>) -> Result<JobReport> {
        self.run(Cadence::Monthly, now)
    }

    pub fn run_yearly(&self, now: DateTime<Utc>) -> Result<JobReport> {
        self.run(Cadence::Yearly, now)
    }
}

// ── Schedule ──────────────────────────────────────────────────────────────────

/// Called with the instant the job's bucket closed.
pub type JobHandler = Arc<dyn Fn(DateTime<Utc>) -> Result<JobReport> + Send + Sync>;

#[derive(Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub cadence: Cadence,
    pub handler: JobHandler,
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.name)
            .field("cadence", &self.cadence)
            .finish_non_exhaustive()
    }
}

/// One job per cadence, each delegating to `jobs`.
pub fn default_schedule(jobs: Arc<AggregationJobs>) -> Vec<ScheduledJob> {
    Cadence::ALL
        .into_iter()
        .map(|cadence| {
            let jobs = Arc::clone(&jobs);
            ScheduledJob {
                name: format!("aggregate-{cadence}"),
                cadence,
                handler: Arc::new(move |now| jobs.run(cadence, now)),
            }
        })
        .collect()
}

/// Something that fires registered jobs on their cadence.
pub trait Scheduler {
    fn register(&mut self, job: ScheduledJob);

    fn jobs(&self) -> &[ScheduledJob];

    fn register_all(&mut self, jobs: impl IntoIterator<Item = ScheduledJob>)
    where
        Self: Sized,
    {
        for job in jobs {
            self.register(job);
        }
    }
}

// ── TokioScheduler ────────────────────────────────────────────────────────────

/// Sent after every job run.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: String,
    pub cadence: Cadence,
    /// Nominal firing instant: bucket boundary plus grace.
    pub fired_at: DateTime<Utc>,
    pub result: std::result::Result<JobReport, String>,
}

/// Runs each job on its own tokio task, sleeping until the next bucket
/// boundary of the job's granularity plus a grace delay for late events.
pub struct TokioScheduler {
    jobs: Vec<ScheduledJob>,
    week_start: Weekday,
    grace: chrono::Duration,
}

impl TokioScheduler {
    pub fn new(week_start: Weekday, grace_secs: u64) -> Self {
        Self {
            jobs: Vec::new(),
            week_start,
            grace: chrono::Duration::seconds(i64::try_from(grace_secs).unwrap_or(i64::MAX)),
        }
    }

    /// Spawn one loop per registered job.
    ///
    /// Returns the outcome stream and a handle that aborts every loop.
    pub fn start(self) -> (mpsc::Receiver<JobOutcome>, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(16);
        let handles = self
            .jobs
            .into_iter()
            .map(|job| {
                let tx = tx.clone();
                let week_start = self.week_start;
                let grace = self.grace;
                tokio::spawn(async move { job_loop(job, week_start, grace, tx).await })
            })
            .collect();
        (rx, SchedulerHandle { handles })
    }
}

impl Scheduler for TokioScheduler {
    fn register(&mut self, job: ScheduledJob) {
        tracing::debug!(job = %job.name, cadence = %job.cadence, "job registered");
        self.jobs.push(job);
    }

    fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }
}

async fn job_loop(
    job: ScheduledJob,
    week_start: Weekday,
    grace: chrono::Duration,
    tx: mpsc::Sender<JobOutcome>,
) {
    let granularity = job.cadence.granularity();
    let mut boundary = bucket_for(Utc::now(), granularity, week_start).end;

    loop {
        let fire_at = boundary + grace;
        let wait = (fire_at - Utc::now()).to_std().unwrap_or_default();
        tracing::debug!(job = %job.name, fire_at = %fire_at, "sleeping until next run");
        tokio::time::sleep(wait).await;

        if tx.is_closed() {
            tracing::debug!(job = %job.name, "outcome channel closed; exiting loop");
            break;
        }

        // The handler gets the boundary, not the firing instant, so a grace
        // as long as the bucket still selects the bucket that just closed.
        let handler = Arc::clone(&job.handler);
        let closed_at = boundary;
        let result = match tokio::task::spawn_blocking(move || handler(closed_at)).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("job task failed: {e}")),
        };
        if let Err(e) = &result {
            tracing::warn!(job = %job.name, "scheduled job failed: {e}");
        }

        let outcome = JobOutcome {
            job: job.name.clone(),
            cadence: job.cadence,
            fired_at: fire_at,
            result,
        };
        if tx.send(outcome).await.is_err() {
            tracing::debug!(job = %job.name, "outcome receiver dropped; exiting loop");
            break;
        }

        boundary = bucket_for(boundary, granularity, week_start).end;
    }
}

/// Aborts every job loop on [`abort`](Self::abort).
pub struct SchedulerHandle {
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
