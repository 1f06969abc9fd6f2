// src/process/drain.rs

use anyhow::{anyhow, Context, Result};
use std::{io::Write, sync::Arc, time::Instant};
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::QueuedRow;
use crate::sink::CsvSink;

/// What the drain consumer reports once the channel is closed and every
/// dispatched write has finished.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub rows_written: u64,
    pub failed_writes: u64,
    /// The first write failure, if any. Later ones are only counted.
    pub first_error: Option<anyhow::Error>,
}

impl DrainReport {
    fn settle(&mut self, res: Result<Result<()>, JoinError>, cancel: &CancellationToken) {
        let err = match res {
            Ok(Ok(())) => {
                self.rows_written += 1;
                return;
            }
            Ok(Err(e)) => e,
            Err(join_err) => anyhow!("write task failed: {}", join_err),
        };
        self.failed_writes += 1;
        if self.first_error.is_none() {
            error!(error = %format!("{:#}", err), "aggregate write failed; cancelling run");
            cancel.cancel();
            self.first_error = Some(err);
        }
    }
}

/// The single consumer of the aggregation channel.
///
/// Each dequeued row is handed to a write task on the blocking pool and the
/// loop goes straight back to the channel. At most `write_workers` writes are
/// in flight; when they are all busy the loop waits for a slot, which in
/// turn lets the channel fill up and block producers. Writes finish in any order, so the
/// aggregate output has no guaranteed row order.
///
/// When the channel closes, outstanding writes are joined and the report is
/// sent on `done`.
pub async fn drain_rows<W: Write + Send + 'static>(
    mut rx: mpsc::Receiver<QueuedRow>,
    sink: Arc<CsvSink<W>>,
    write_workers: usize,
    cancel: CancellationToken,
    done: oneshot::Sender<DrainReport>,
) {
    let start = Instant::now();
    let slots = Arc::new(Semaphore::new(write_workers.max(1)));
    let mut writes: JoinSet<Result<()>> = JoinSet::new();
    let mut report = DrainReport::default();

    while let Some(queued) = rx.recv().await {
        let Ok(slot) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let sink = Arc::clone(&sink);
        writes.spawn_blocking(move || {
            let _slot = slot;
            // `queued` is dropped after the append, completing its work unit
            sink.append(&queued.row)
                .with_context(|| format!("row from {}", queued.file))
        });

        while let Some(res) = writes.try_join_next() {
            report.settle(res, &cancel);
        }
    }

    debug!(in_flight = writes.len(), "channel closed; joining writes");
    while let Some(res) = writes.join_next().await {
        report.settle(res, &cancel);
    }

    info!(
        rows = report.rows_written,
        failed = report.failed_writes,
        elapsed = ?start.elapsed(),
        "drain finished"
    );
    if done.send(report).is_err() {
        debug!("nobody waiting for the drain report");
    }
}
