// Numan Thabit 2025
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use llm_stress::output::{write_json, RunOutput};
use llm_stress::{
    build_backend, sample_queries, schedule, CliArgs, Dispatcher, Executor, Report, RunConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = CliArgs::parse();
    let config = RunConfig::from_cli(&cli).context("invalid configuration")?;

    let queries = sample_queries(&config.queries, config.total_requests, config.seed)?;
    let tasks = schedule(queries, config.rate)?;
    let dispatcher = Dispatcher::new(config.concurrency)?;

    if config.dry_run {
        let horizon = tasks.last().map(|task| task.scheduled_start).unwrap_or_default();
        info!(
            tasks = tasks.len(),
            workers = dispatcher.concurrency().min(tasks.len()),
            dispatch_window = %humantime::format_duration(horizon),
            "dry run; no requests sent"
        );
        return Ok(());
    }

    let backend = build_backend(&config.backend);
    let executor = Arc::new(
        Executor::new(
            backend,
            config.request_timeout,
            config.ttft_mode,
            config.concurrency,
        )
        .context("failed to build http client")?,
    );

    let run_id = Uuid::new_v4();
    let started_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format start time")?;
    info!(%run_id, %started_at, "run started");

    let records = dispatcher.run(tasks, executor).await;
    let report = Report::from_records(&records);
    info!(
        %run_id,
        requests = report.requests,
        completed = report.completed,
        span_ms = report.span_ms,
        "run finished"
    );
    if report.completed == 0 {
        warn!(%run_id, "no request completed successfully");
    }

    print!("{report}");

    if let Some(path) = config.output_json.as_deref() {
        let output = RunOutput::new(run_id, started_at, &config, &report, &records);
        write_json(path, &output)?;
        info!(path = %path.display(), records = records.len(), "persisted run output");
    }

    Ok(())
}
