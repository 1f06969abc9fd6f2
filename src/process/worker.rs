// src/process/worker.rs

use anyhow::{anyhow, Context};
use std::{fmt, io::Write, path::Path, sync::Arc, time::Instant};
use tracing::{debug, error, info, instrument, warn};

use super::{
    discover::display_name,
    workbook::{is_blank, WorkbookOpener},
    FileContext, QueuedRow,
};
use crate::{
    pipeline::tracker::{WorkGuard, WorkKind},
    schema::{validate, ColumnLocator},
};

/// Why a file stopped early.
#[derive(Debug)]
pub enum FileError {
    /// The file itself could not be opened or read. Only this file is affected.
    /// `validated` is set once the file's validation record has been written.
    Unreadable {
        error: anyhow::Error,
        validated: bool,
    },
    /// A shared output failed. The whole run has to stop.
    Sink(anyhow::Error),
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileError::Unreadable { error, .. } => write!(f, "unreadable: {:#}", error),
            FileError::Sink(e) => write!(f, "output failed: {:#}", e),
        }
    }
}

impl std::error::Error for FileError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Completed,
    Cancelled,
    Unreadable(String),
    SinkFailed(String),
}

/// What one file worker did.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub file_name: String,
    pub sheets: usize,
    pub rows_sent: u64,
    pub blank_rows: u64,
    pub missing_fields: usize,
    pub outcome: FileOutcome,
}

impl FileReport {
    fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            sheets: 0,
            rows_sent: 0,
            blank_rows: 0,
            missing_fields: 0,
            outcome: FileOutcome::Completed,
        }
    }
}

/// Read one spreadsheet and push its rows, in canonical order, onto the
/// aggregation channel.
///
/// Every non-empty sheet starts with a header row that is located on its own,
/// so sheets may order their columns differently. The first header found is
/// the one validated for the file, and it makes sure the aggregate header
/// exists. Header rows are never emitted and blank rows are dropped.
///
/// Runs on a blocking thread: sends block while the channel is full.
#[instrument(level = "info", skip_all, fields(file = %display_name(path)))]
pub fn process_file<W: Write>(
    ctx: &FileContext<W>,
    opener: &dyn WorkbookOpener,
    path: &Path,
) -> Result<FileReport, FileError> {
    let start = Instant::now();
    let file_name = display_name(path);
    let name: Arc<str> = Arc::from(file_name.as_str());
    let mut report = FileReport::new(&file_name);

    let mut book = opener.open(path).map_err(|error| FileError::Unreadable {
        error,
        validated: false,
    })?;
    let mut file_layout: Option<ColumnLocator> = None;

    for sheet in book.sheet_names() {
        if ctx.cancel.is_cancelled() {
            report.outcome = FileOutcome::Cancelled;
            break;
        }

        let mut rows = book
            .rows(&sheet)
            .with_context(|| format!("sheet {} of {}", sheet, file_name))
            .map_err(|error| FileError::Unreadable {
                error,
                validated: file_layout.is_some(),
            })?;
        report.sheets += 1;

        let Some(header) = rows.next() else {
            debug!(sheet = %sheet, "empty sheet");
            continue;
        };

        let loc = ColumnLocator::from_headers(&header);
        if file_layout.is_none() {
            start_file(ctx, &loc, &file_name, &mut report)?;
            file_layout = Some(loc.clone());
        } else if file_layout.as_ref() != Some(&loc) {
            info!(sheet = %sheet, "sheet has its own column layout");
        }

        if send_rows(ctx, &loc, rows, &name, &mut report)? {
            report.outcome = FileOutcome::Cancelled;
            break;
        }
    }

    if file_layout.is_none() && report.outcome == FileOutcome::Completed {
        warn!("no rows in any sheet");
        start_file(ctx, &ColumnLocator::default(), &file_name, &mut report)?;
    }

    info!(
        sheets = report.sheets,
        rows = report.rows_sent,
        missing = report.missing_fields,
        elapsed = ?start.elapsed(),
        "file done"
    );
    Ok(report)
}

/// Header handling for a file: validate its layout, and make sure the
/// aggregate output has its header before this file sends any rows.
fn start_file<W: Write>(
    ctx: &FileContext<W>,
    loc: &ColumnLocator,
    file_name: &str,
    report: &mut FileReport,
) -> Result<(), FileError> {
    let rec = validate::validate(loc, file_name);
    report.missing_fields = rec.missing_count();
    {
        let _unit = ctx.tracker.register(WorkKind::Validation);
        validate::record(&*ctx.validation, &rec).map_err(FileError::Sink)?;
    }
    {
        let _unit = ctx.tracker.register(WorkKind::Header);
        if ctx.aggregate.ensure_header().map_err(FileError::Sink)? {
            debug!("wrote aggregate header");
        }
    }
    Ok(())
}

/// Queue every non-blank row. Returns true if cancelled part way.
fn send_rows<W: Write>(
    ctx: &FileContext<W>,
    loc: &ColumnLocator,
    rows: impl Iterator<Item = Vec<String>>,
    name: &Arc<str>,
    report: &mut FileReport,
) -> Result<bool, FileError> {
    for row in rows {
        if ctx.cancel.is_cancelled() {
            return Ok(true);
        }
        if is_blank(&row) {
            report.blank_rows += 1;
            continue;
        }
        let unit = ctx.tracker.register(WorkKind::Row);
        let queued = QueuedRow::new(loc.reorder(&row), Arc::clone(name), unit);
        ctx.tx
            .blocking_send(queued)
            .map_err(|_| FileError::Sink(anyhow!("aggregation channel closed")))?;
        report.rows_sent += 1;
    }
    Ok(false)
}

/// Run one file to completion and turn any failure into a report.
///
/// An unreadable file gets an `unreadable` validation record and the run
/// carries on. An output failure cancels the run. `unit` is the file's own
/// work unit and completes when this returns.
pub fn run_file_worker<W: Write>(
    ctx: &FileContext<W>,
    opener: &dyn WorkbookOpener,
    path: &Path,
    unit: WorkGuard,
) -> FileReport {
    let file_name = display_name(path);
    let report = match process_file(ctx, opener, path) {
        Ok(report) => report,
        Err(FileError::Unreadable { error, validated }) => {
            error!(file = %file_name, error = %format!("{:#}", error), "file failed");
            let mut report = FileReport::new(&file_name);
            report.outcome = FileOutcome::Unreadable(format!("{:#}", error));
            if validated {
                // the file already has its one validation record
                return report;
            }

            let _rec = ctx.tracker.register(WorkKind::Validation);
            let rec = validate::ValidationRecord::unreadable(&file_name);
            if let Err(sink_err) = validate::record(&*ctx.validation, &rec) {
                error!(error = %format!("{:#}", sink_err), "validation output failed");
                ctx.cancel.cancel();
                report.outcome = FileOutcome::SinkFailed(format!("{:#}", sink_err));
            }
            report
        }
        Err(FileError::Sink(e)) => {
            error!(file = %file_name, error = %format!("{:#}", e), "output failed; cancelling run");
            ctx.cancel.cancel();
            let mut report = FileReport::new(&file_name);
            report.outcome = FileOutcome::SinkFailed(format!("{:#}", e));
            report
        }
    };
    drop(unit);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::tracker::WorkTracker,
        process::workbook::memory::{row, sheet, MemoryOpener},
        schema::{AGGREGATE_HEADER, VALIDATION_HEADER},
        sink::CsvSink,
    };
    use std::path::PathBuf;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        ctx: FileContext<Vec<u8>>,
        rx: mpsc::Receiver<QueuedRow>,
    }

    fn harness(capacity: usize) -> Harness {
        let (tx, rx) = mpsc::channel(capacity);
        Harness {
            ctx: FileContext {
                aggregate: Arc::new(CsvSink::from_writer("aggregate", Vec::new(), &AGGREGATE_HEADER)),
                validation: Arc::new(CsvSink::from_writer(
                    "validation",
                    Vec::new(),
                    &VALIDATION_HEADER,
                )),
                tx,
                tracker: WorkTracker::new(),
                cancel: CancellationToken::new(),
            },
            rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<QueuedRow>) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        while let Ok(q) = rx.try_recv() {
            out.push(q.row.clone());
        }
        out
    }

    fn validation_lines(ctx: FileContext<Vec<u8>>) -> Vec<String> {
        let sink = Arc::try_unwrap(ctx.validation).ok().unwrap();
        String::from_utf8(sink.into_inner().unwrap())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn reorders_rows_and_skips_blank_lines() {
        let opener = MemoryOpener::new().with_book(
            "missing.xlsx",
            vec![sheet(
                "Sheet1",
                vec![
                    row(&["Sat Acct", "Bill Status", "Host Bill To"]),
                    row(&["A1", "Active", "2022-02-01"]),
                    row(&["", "", ""]),
                    row(&["A2", "Closed"]),
                ],
            )],
        );
        let mut h = harness(16);
        let report = process_file(&h.ctx, &opener, &PathBuf::from("/d/missing.xlsx")).unwrap();
        assert_eq!(report.outcome, FileOutcome::Completed);
        assert_eq!(report.rows_sent, 2);
        assert_eq!(report.blank_rows, 1);
        assert_eq!(report.missing_fields, 6);

        let rows = drain(&mut h.rx);
        assert_eq!(
            rows[0],
            row(&["A1", "Active", "", "2022-02-01", "", "", "", "", ""])
        );
        assert_eq!(rows[1], row(&["A2", "Closed", "", "", "", "", "", "", ""]));

        // dropping the queued rows released their work units
        assert_eq!(h.ctx.tracker.pending(), 0);

        let lines = validation_lines(h.ctx);
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "missing.xlsx,true,true,false,true,false,false,false,false,false"
        );
    }

    #[test]
    fn later_sheets_skip_their_header_row() {
        let opener = MemoryOpener::new().with_book(
            "two.xlsx",
            vec![
                sheet("Empty", vec![]),
                sheet("Jan", vec![row(&["Applied", "Sat Acct"]), row(&["1", "A"])]),
                sheet("Feb", vec![row(&["Applied", "Sat Acct"]), row(&["2", "B"])]),
            ],
        );
        let mut h = harness(16);
        let report = process_file(&h.ctx, &opener, Path::new("two.xlsx")).unwrap();
        assert_eq!(report.sheets, 3);
        assert_eq!(report.rows_sent, 2);

        let rows = drain(&mut h.rx);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "A");
        assert_eq!(rows[0][7], "1");
        assert_eq!(rows[1][0], "B");

        // one validation record per file, not per sheet
        assert_eq!(validation_lines(h.ctx).len(), 2);
    }

    #[test]
    fn each_sheet_is_located_by_its_own_header() {
        let opener = MemoryOpener::new().with_book(
            "swapped.xlsx",
            vec![
                sheet("Jan", vec![row(&["Sat Acct", "Applied"]), row(&["A", "1"])]),
                sheet("Feb", vec![row(&["Applied", "Sat Acct"]), row(&["2", "B"])]),
            ],
        );
        let mut h = harness(16);
        let report = process_file(&h.ctx, &opener, Path::new("swapped.xlsx")).unwrap();
        assert_eq!(report.rows_sent, 2);

        let rows = drain(&mut h.rx);
        assert_eq!((rows[0][0].as_str(), rows[0][7].as_str()), ("A", "1"));
        assert_eq!((rows[1][0].as_str(), rows[1][7].as_str()), ("B", "2"));

        // the file is validated against its first sheet only
        let lines = validation_lines(h.ctx);
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "swapped.xlsx,true,false,false,false,false,false,false,true,false"
        );
    }

    #[test]
    fn failing_later_sheet_keeps_a_single_validation_record() {
        let opener = MemoryOpener::new()
            .with_book(
                "x.xlsx",
                vec![
                    sheet("S1", vec![row(&["Sat Acct"]), row(&["A1"])]),
                    sheet("S2", vec![]),
                ],
            )
            .with_broken_sheet("x.xlsx", "S2");
        let mut h = harness(16);
        let unit = h.ctx.tracker.register(WorkKind::File);
        let report = run_file_worker(&h.ctx, &opener, Path::new("x.xlsx"), unit);
        assert!(matches!(report.outcome, FileOutcome::Unreadable(_)));
        assert!(!h.ctx.cancel.is_cancelled());

        drop(drain(&mut h.rx));
        assert_eq!(h.ctx.tracker.pending(), 0);

        let lines = validation_lines(h.ctx);
        let for_file: Vec<&String> = lines.iter().filter(|l| l.starts_with("x.xlsx,")).collect();
        assert_eq!(for_file.len(), 1);
        assert!(for_file[0].starts_with("x.xlsx,true,false,"));
    }

    #[test]
    fn file_without_rows_is_reported_all_missing() {
        let opener = MemoryOpener::new().with_book("blank.xlsx", vec![sheet("S", vec![])]);
        let mut h = harness(4);
        let report = process_file(&h.ctx, &opener, Path::new("blank.xlsx")).unwrap();
        assert_eq!(report.rows_sent, 0);
        assert_eq!(report.missing_fields, 9);
        assert!(drain(&mut h.rx).is_empty());
        assert_eq!(
            validation_lines(h.ctx)[1],
            "blank.xlsx,false,false,false,false,false,false,false,false,false"
        );
    }

    #[test]
    fn unreadable_file_is_recorded_and_isolated() {
        let h = harness(4);
        let unit = h.ctx.tracker.register(WorkKind::File);
        let report = run_file_worker(&h.ctx, &MemoryOpener::new(), Path::new("corrupt.xlsx"), unit);
        assert!(matches!(report.outcome, FileOutcome::Unreadable(_)));
        assert!(!h.ctx.cancel.is_cancelled());
        assert_eq!(h.ctx.tracker.pending(), 0);

        let lines = validation_lines(h.ctx);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("corrupt.xlsx,unreadable,"));
    }

    #[test]
    fn closed_channel_cancels_the_run() {
        let opener = MemoryOpener::new().with_book(
            "a.xlsx",
            vec![sheet("S", vec![row(&["Sat Acct"]), row(&["A1"])])],
        );
        let h = harness(4);
        drop(h.rx);
        let unit = h.ctx.tracker.register(WorkKind::File);
        let report = run_file_worker(&h.ctx, &opener, Path::new("a.xlsx"), unit);
        assert!(matches!(report.outcome, FileOutcome::SinkFailed(_)));
        assert!(h.ctx.cancel.is_cancelled());
        assert_eq!(h.ctx.tracker.pending(), 0);
    }

    #[test]
    fn cancelled_before_start_sends_nothing() {
        let opener = MemoryOpener::new().with_book(
            "a.xlsx",
            vec![sheet("S", vec![row(&["Sat Acct"]), row(&["A1"])])],
        );
        let mut h = harness(4);
        h.ctx.cancel.cancel();
        let report = process_file(&h.ctx, &opener, Path::new("a.xlsx")).unwrap();
        assert_eq!(report.outcome, FileOutcome::Cancelled);
        assert!(drain(&mut h.rx).is_empty());
    }
}
