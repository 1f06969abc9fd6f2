use anyhow::{Context, Result};
use bcrmerge::{
    config::{Args, Config},
    pipeline::{Pipeline, RunSummary},
    process::CalamineOpener,
    schema::{AGGREGATE_HEADER, VALIDATION_HEADER},
    sink::CsvSink,
};
use chrono::Utc;
use clap::Parser;
use std::{env, fs::File, io::BufWriter, path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cwd = env::current_dir().context("reading working directory")?;
    let config = Config::resolve(args, &cwd)?;

    // ─── 1) init logging ─────────────────────────────────────────────
    let log_level = if config.verbose {
        "debug".to_string()
    } else {
        env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(log_level.parse().unwrap_or(Level::INFO.into())),
        )
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {:?}", info);
    }));

    // ─── 2) outputs ──────────────────────────────────────────────────
    let outputs = config.output_paths(Utc::now());
    info!(
        dataset = %config.dataset,
        dir = %config.dataset_dir.display(),
        file_workers = config.pipeline.file_workers,
        write_workers = config.pipeline.write_workers,
        "startup"
    );

    let aggregate = Arc::new(CsvSink::create(
        "aggregate",
        &outputs.aggregate,
        &AGGREGATE_HEADER,
    )?);
    let validation = Arc::new(CsvSink::create(
        "validation",
        &outputs.validation,
        &VALIDATION_HEADER,
    )?);

    // ─── 3) ctrl-c stops new work; queued rows still drain ───────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing queued rows");
                cancel.cancel();
            }
        });
    }

    // ─── 4) run ──────────────────────────────────────────────────────
    let pipeline = Pipeline::new(config.pipeline.clone(), CalamineOpener);
    let summary = pipeline
        .run(&config.dataset_dir, aggregate, validation, cancel)
        .await?;

    info!(
        aggregate = %outputs.aggregate.display(),
        validation = %outputs.validation.display(),
        "outputs written"
    );
    if let Some(path) = &config.summary_path {
        write_summary(path, &summary)?;
        info!(path = %path.display(), "summary written");
    }

    if summary.has_failures() {
        error!(
            failed = ?summary.failed_files,
            cancelled = summary.cancelled,
            "run finished with failures"
        );
        std::process::exit(1);
    }
    Ok(())
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("creating summary file {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)
        .with_context(|| format!("writing summary file {}", path.display()))
}
