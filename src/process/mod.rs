// src/process/mod.rs
pub mod discover;
pub mod drain;
pub mod workbook;
pub mod worker;

use std::{io::Write, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    pipeline::tracker::{WorkGuard, WorkTracker},
    sink::CsvSink,
};

pub use discover::{discover_files, Discovery};
pub use drain::{drain_rows, DrainReport};
pub use workbook::{first_header, CalamineOpener, Rows, Workbook, WorkbookOpener};
pub use worker::{process_file, run_file_worker, FileError, FileOutcome, FileReport};

/// A row already in canonical order, on its way to the aggregate sink.
///
/// The guard keeps the row counted as outstanding work until the write that
/// consumes it has finished.
pub struct QueuedRow {
    pub row: Vec<String>,
    pub file: Arc<str>,
    _guard: WorkGuard,
}

impl QueuedRow {
    pub fn new(row: Vec<String>, file: Arc<str>, guard: WorkGuard) -> Self {
        Self {
            row,
            file,
            _guard: guard,
        }
    }
}

/// Everything a file worker shares with the rest of the run.
pub struct FileContext<W: Write> {
    pub aggregate: Arc<CsvSink<W>>,
    pub validation: Arc<CsvSink<W>>,
    pub tx: mpsc::Sender<QueuedRow>,
    pub tracker: WorkTracker,
    pub cancel: CancellationToken,
}

impl<W: Write> Clone for FileContext<W> {
    fn clone(&self) -> Self {
        Self {
            aggregate: Arc::clone(&self.aggregate),
            validation: Arc::clone(&self.validation),
            tx: self.tx.clone(),
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
        }
    }
}
