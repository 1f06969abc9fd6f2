//! The ingestion run: fan out one worker per spreadsheet, fan rows back in
//! through a bounded channel, and shut down in order.
//!
//! Shutdown happens in two phases. First the driver waits for every file
//! worker to return, or for the run to be cancelled. Then it gives the work
//! tracker `drain_timeout` to report nothing outstanding: every file still
//! stopping, every queued row and every header or validation write. Only
//! then is the channel closed and the drain consumer's report collected
//! before the sinks are flushed. Closing earlier would drop queued rows;
//! flushing earlier would miss writes still in flight.

pub mod tracker;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    io::Write,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::{JoinError, JoinSet},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    process::{
        discover_files, drain_rows, run_file_worker, FileContext, FileOutcome, FileReport,
        QueuedRow, WorkbookOpener,
    },
    sink::CsvSink,
};
use tracker::{WorkKind, WorkTracker};

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows the aggregation channel holds before producers block.
    pub channel_capacity: usize,
    /// Aggregate writes allowed in flight at once.
    pub write_workers: usize,
    /// Files read at the same time.
    pub file_workers: usize,
    /// How long queued rows may take to be written once the file workers
    /// are done or the run is cancelled.
    pub drain_timeout: Duration,
    /// Spreadsheet extensions to pick up, without the dot.
    pub extensions: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            write_workers: 4,
            file_workers: num_cpus::get(),
            drain_timeout: Duration::from_secs(300),
            extensions: vec!["xlsx".to_string()],
        }
    }
}

/// Counts for one run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub files_discovered: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    pub files_cancelled: usize,
    pub discovery_errors: usize,
    pub rows_queued: u64,
    pub rows_written: u64,
    pub validation_records: u64,
    pub failed_files: Vec<String>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// True if anything was skipped, unreadable, or cut short.
    pub fn has_failures(&self) -> bool {
        self.files_failed > 0 || self.discovery_errors > 0 || self.cancelled
    }

    fn add_file(&mut self, report: FileReport) {
        self.rows_queued += report.rows_sent;
        match report.outcome {
            FileOutcome::Completed => self.files_completed += 1,
            FileOutcome::Cancelled => self.files_cancelled += 1,
            FileOutcome::Unreadable(_) | FileOutcome::SinkFailed(_) => {
                self.files_failed += 1;
                self.failed_files.push(report.file_name);
            }
        }
    }
}

/// How the file workers ended, beyond what the summary counts.
#[derive(Default)]
struct WorkerTally {
    sink_error: Option<String>,
    panicked: usize,
}

impl WorkerTally {
    fn settle(&mut self, res: Result<FileReport, JoinError>, summary: &mut RunSummary) {
        match res {
            Ok(report) => {
                if let FileOutcome::SinkFailed(msg) = &report.outcome {
                    self.sink_error.get_or_insert_with(|| msg.clone());
                }
                summary.add_file(report);
            }
            Err(e) => {
                error!(error = %e, "file worker panicked");
                self.panicked += 1;
                summary.files_failed += 1;
            }
        }
    }
}

pub struct Pipeline<O: WorkbookOpener> {
    config: PipelineConfig,
    opener: Arc<O>,
}

impl<O: WorkbookOpener> Pipeline<O> {
    pub fn new(config: PipelineConfig, opener: O) -> Self {
        Self {
            config,
            opener: Arc::new(opener),
        }
    }

    /// Ingest every spreadsheet under `root` into the two sinks.
    ///
    /// Returns an error when an output could not be written or the drain
    /// did not finish in time. Unreadable files do not fail the run; they
    /// show up in the summary and the validation output.
    #[instrument(level = "info", skip_all, fields(root = %root.display()))]
    pub async fn run<W: Write + Send + 'static>(
        &self,
        root: &Path,
        aggregate: Arc<CsvSink<W>>,
        validation: Arc<CsvSink<W>>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let cfg = &self.config;
        if cfg.channel_capacity == 0 || cfg.file_workers == 0 {
            bail!("channel capacity and file workers must be at least 1");
        }

        let tracker = WorkTracker::new();
        let discovery_unit = tracker.register(WorkKind::Discovery);

        let discovered = {
            let root = root.to_path_buf();
            let extensions = cfg.extensions.clone();
            tokio::task::spawn_blocking(move || discover_files(&root, &extensions))
                .await
                .context("discovery task failed")??
        };
        info!(
            files = discovered.files.len(),
            errors = discovered.errors.len(),
            "discovered spreadsheets"
        );

        let mut summary = RunSummary {
            files_discovered: discovered.files.len(),
            discovery_errors: discovered.errors.len(),
            ..Default::default()
        };

        // ─── drain consumer ──────────────────────────────────────────────
        let (tx, rx) = mpsc::channel::<QueuedRow>(cfg.channel_capacity);
        let (done_tx, done_rx) = oneshot::channel();
        let drain = tokio::spawn(drain_rows(
            rx,
            Arc::clone(&aggregate),
            cfg.write_workers,
            cancel.clone(),
            done_tx,
        ));

        // ─── fan out one worker per file ─────────────────────────────────
        let ctx = FileContext {
            aggregate: Arc::clone(&aggregate),
            validation: Arc::clone(&validation),
            tx: tx.clone(),
            tracker: tracker.clone(),
            cancel: cancel.clone(),
        };
        let slots = Arc::new(Semaphore::new(cfg.file_workers));
        let mut workers = JoinSet::new();
        let mut not_started = 0usize;

        for path in discovered.files {
            let unit = tracker.register(WorkKind::File);
            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    not_started += 1;
                    continue;
                }
                slot = Arc::clone(&slots).acquire_owned() => slot.context("file worker pool closed")?,
            };
            let ctx = ctx.clone();
            let opener = Arc::clone(&self.opener);
            workers.spawn_blocking(move || {
                let _slot = slot;
                run_file_worker(&ctx, opener.as_ref(), &path, unit)
            });
        }
        drop(ctx);
        drop(discovery_unit);
        if not_started > 0 {
            warn!(files = not_started, "cancelled before these files started");
        }
        summary.files_cancelled += not_started;

        // ─── phase 1: every file worker returns, or the run is cancelled ─
        let mut tally = WorkerTally::default();
        loop {
            tokio::select! {
                biased;
                res = workers.join_next() => match res {
                    Some(res) => tally.settle(res, &mut summary),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    warn!("run cancelled; waiting for queued rows");
                    break;
                }
            }
        }

        // ─── phase 2: outstanding work gets `drain_timeout` to settle ───
        if timeout(cfg.drain_timeout, tracker.wait_idle()).await.is_err() {
            cancel.cancel();
            drain.abort();
            bail!(
                "{} units of work still outstanding after {:?}",
                tracker.pending(),
                cfg.drain_timeout
            );
        }
        drop(tx);
        info!("all work settled; channel closed");

        let drained = done_rx
            .await
            .context("drain consumer stopped without reporting")?;
        drain.await.context("drain task failed")?;

        // workers that were still stopping when the run was cancelled
        while let Some(res) = workers.join_next().await {
            tally.settle(res, &mut summary);
        }

        summary.rows_written = drained.rows_written;
        summary.validation_records = validation.records_written()?;
        summary.cancelled = cancel.is_cancelled();
        summary.elapsed_ms = start.elapsed().as_millis() as u64;

        // flush both before reporting any error
        let flushed = [aggregate.flush(), validation.flush()];

        if let Some(err) = drained.first_error {
            return Err(err.context("writing aggregate output"));
        }
        if let Some(msg) = tally.sink_error {
            bail!("output failed: {}", msg);
        }
        for res in flushed {
            res?;
        }
        if tally.panicked > 0 {
            bail!("{} file workers panicked", tally.panicked);
        }

        info!(
            files = summary.files_discovered,
            completed = summary.files_completed,
            failed = summary.files_failed,
            rows = summary.rows_written,
            elapsed = ?start.elapsed(),
            "run finished"
        );
        Ok(summary)
    }
}
