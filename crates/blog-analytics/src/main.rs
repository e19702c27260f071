mod bootstrap;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use analytics_core::models::{Dimension, Granularity, MetricKind};
use analytics_core::settings::{
    AggregateArgs, BackfillArgs, Command, EngineConfig, QueryArgs, Settings,
};
use analytics_core::time_utils::{parse_date, parse_instant};
use analytics_data::aggregator::{AggregationEngine, AggregationOptions};
use analytics_data::router::{parse_filters, QueryRequest, QueryRouter};
use analytics_runtime::backfill::{BackfillOrchestrator, BackfillRequest};
use analytics_runtime::scheduler::{
    default_schedule, AggregationJobs, Cadence, Scheduler, TokioScheduler,
};
use anyhow::{Context, Result};
use chrono::Utc;

#[tokio::main]
async fn main() -> Result<()> {
    let (settings, config) = Settings::load_with_config();

    bootstrap::ensure_directories()?;
    bootstrap::setup_logging(&settings.log_level, settings.debug, settings.log_file.as_ref())?;

    tracing::info!("Blog Analytics v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Database: {}, week start: {}, breakdown: {}",
        config.database_path().display(),
        config.week_start,
        config.breakdown.as_str()
    );

    match &settings.command {
        Command::Backfill(args) => run_backfill(&config, args).await,
        Command::Aggregate(args) => run_aggregate(&config, args).await,
        Command::Schedule => run_schedule(&config).await,
        Command::Query(args) => run_query(&config, args),
    }
}

fn build_engine(config: &EngineConfig) -> Result<Arc<AggregationEngine>> {
    let source = bootstrap::open_source(config)?;
    let store = bootstrap::open_store(config)?;
    Ok(Arc::new(AggregationEngine::new(
        source,
        store,
        AggregationOptions::from(config),
    )))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── backfill ───────────────────────────────────────────────────────────────────

async fn run_backfill(config: &EngineConfig, args: &BackfillArgs) -> Result<()> {
    let request = BackfillRequest {
        granularities: args.granularity.parse()?,
        start_date: args.start_date.as_deref().map(parse_date).transpose()?,
        end_date: args.end_date.as_deref().map(parse_date).transpose()?,
        clear: args.clear,
        kinds: match args.kind.as_str() {
            "all" => MetricKind::ALL.to_vec(),
            kind => vec![kind.parse()?],
        },
    };

    let orchestrator = Arc::new(BackfillOrchestrator::new(build_engine(config)?));
    let cancel = orchestrator.cancel_flag();
    let mut task = tokio::task::spawn_blocking(move || orchestrator.backfill(&request));

    let report = tokio::select! {
        joined = &mut task => joined.context("backfill task failed")??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received; stopping backfill after the current bucket");
            cancel.store(true, Ordering::Relaxed);
            task.await.context("backfill task failed")??
        }
    };

    print_json(&report)?;
    if report.buckets_failed() > 0 {
        tracing::warn!(
            failed = report.buckets_failed(),
            "some buckets failed; re-run the same backfill to retry them"
        );
    }
    Ok(())
}

// ── aggregate ──────────────────────────────────────────────────────────────────

async fn run_aggregate(config: &EngineConfig, args: &AggregateArgs) -> Result<()> {
    let cadence: Cadence = args.cadence.parse()?;
    let now = match args.at.as_deref() {
        Some(at) => parse_instant(at)?,
        None => Utc::now(),
    };

    let jobs = AggregationJobs::new(build_engine(config)?);
    let report = tokio::task::spawn_blocking(move || jobs.run(cadence, now))
        .await
        .context("aggregation task failed")??;
    print_json(&report)
}

// ── schedule ───────────────────────────────────────────────────────────────────

async fn run_schedule(config: &EngineConfig) -> Result<()> {
    let jobs = Arc::new(AggregationJobs::new(build_engine(config)?));

    let mut scheduler = TokioScheduler::new(config.week_start, config.schedule_grace_secs);
    scheduler.register_all(default_schedule(jobs));
    for job in scheduler.jobs() {
        tracing::info!("Registered job {} ({})", job.name, job.cadence);
    }

    let (mut rx, handle) = scheduler.start();
    loop {
        tokio::select! {
            outcome = rx.recv() => {
                let Some(outcome) = outcome else { break };
                match &outcome.result {
                    Ok(report) => tracing::info!(
                        job = %outcome.job,
                        bucket = %report.bucket.label(),
                        clean = report.is_clean(),
                        "job finished"
                    ),
                    Err(e) => tracing::error!(job = %outcome.job, "job failed: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received; stopping scheduler");
                break;
            }
        }
    }
    handle.abort();
    Ok(())
}

// ── query ──────────────────────────────────────────────────────────────────────

fn run_query(config: &EngineConfig, args: &QueryArgs) -> Result<()> {
    let mut request = QueryRequest::new(
        args.kind.parse()?,
        parse_instant(&args.start)?,
        parse_instant(&args.end)?,
    )
    .with_filter(parse_filters(&args.filters)?);
    if let Some(unit) = args.compare.as_deref() {
        request = request.with_compare_unit(unit.parse::<Granularity>()?);
    }

    let router = QueryRouter::new(
        bootstrap::open_store(config)?,
        config.week_start,
        config.breakdown,
    );
    match args.shape.as_str() {
        "series" => print_json(&router.time_series(&request)?),
        "top" => {
            let dimension: Dimension = args.top.parse()?;
            print_json(&router.top(&request, dimension, args.limit)?)
        }
        _ => print_json(&router.performance(&request)?),
    }
}
