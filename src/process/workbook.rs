// src/process/workbook.rs

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader, Sheets};
use std::{fs::File, io::BufReader, path::Path};

/// Rows of one sheet, top to bottom, rendered as they are pulled.
pub type Rows = Box<dyn Iterator<Item = Vec<String>>>;

/// An opened spreadsheet: an ordered list of sheets, each an ordered list of rows.
pub trait Workbook {
    fn sheet_names(&self) -> Vec<String>;

    /// The rows of `sheet`, each cell rendered as a string.
    fn rows(&mut self, sheet: &str) -> Result<Rows>;
}

/// Opens workbooks by path. Shared by every file worker.
pub trait WorkbookOpener: Send + Sync + 'static {
    fn open(&self, path: &Path) -> Result<Box<dyn Workbook>>;
}

/// Reads `.xlsx` (and anything else calamine recognises) from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct CalamineOpener;

impl WorkbookOpener for CalamineOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Workbook>> {
        let sheets = open_workbook_auto(path)
            .with_context(|| format!("opening workbook {}", path.display()))?;
        Ok(Box::new(CalamineWorkbook { sheets }))
    }
}

struct CalamineWorkbook {
    sheets: Sheets<BufReader<File>>,
}

impl Workbook for CalamineWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.sheet_names()
    }

    fn rows(&mut self, sheet: &str) -> Result<Rows> {
        // calamine decodes the whole sheet into a range; cells are rendered per row
        let range = self
            .sheets
            .worksheet_range(sheet)
            .with_context(|| format!("reading sheet {}", sheet))?;

        // ranges start at the first used cell; pad so column numbers match the sheet
        let lead = range.start().map(|(_, col)| col as usize).unwrap_or(0);
        let (height, width) = range.get_size();
        Ok(Box::new((0..height).map(move |r| {
            let mut out = Vec::with_capacity(lead + width);
            out.resize(lead, String::new());
            out.extend((0..width).map(|c| {
                range
                    .get((r, c))
                    .map(cell_to_string)
                    .unwrap_or_default()
            }));
            out
        })))
    }
}

/// Render one cell the way it reads in the spreadsheet.
pub fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ndt) if ndt.time() == chrono::NaiveTime::MIN => {
                ndt.format("%Y-%m-%d").to_string()
            }
            Some(ndt) => ndt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => dt.as_f64().to_string(),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => e.to_string(),
    }
}

/// True when every cell is empty or whitespace.
pub fn is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

/// The header row a file is located by: the first row of its first non-empty
/// sheet. `None` when every sheet is empty.
pub fn first_header(book: &mut dyn Workbook) -> Result<Option<Vec<String>>> {
    for sheet in book.sheet_names() {
        if let Some(header) = book.rows(&sheet)?.next() {
            return Ok(Some(header));
        }
    }
    Ok(None)
}
