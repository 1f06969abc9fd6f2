// src/schema/validate.rs

use anyhow::{Context, Result};
use std::io::Write;
use tracing::{debug, warn};

use super::{
    fields::{CanonicalField, FIELD_COUNT},
    locate::ColumnLocator,
};
use crate::sink::CsvSink;

/// Per-field outcome for one input file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldStatus {
    Found,
    Missing,
    /// The file could not be read, so nothing is known about the field.
    Unreadable,
}

impl FieldStatus {
    pub fn as_str(&self) -> &str {
        match self {
            FieldStatus::Found => "true",
            FieldStatus::Missing => "false",
            FieldStatus::Unreadable => "unreadable",
        }
    }
}

/// One row of the validation report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRecord {
    pub file_name: String,
    pub statuses: [FieldStatus; FIELD_COUNT],
}

impl ValidationRecord {
    pub fn unreadable(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            statuses: [FieldStatus::Unreadable; FIELD_COUNT],
        }
    }

    pub fn status(&self, field: CanonicalField) -> FieldStatus {
        self.statuses[field.index()]
    }

    pub fn missing_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == FieldStatus::Missing)
            .count()
    }

    /// `[file name, status × 9]`, the layout of the validation output.
    pub fn to_record(&self) -> Vec<String> {
        std::iter::once(self.file_name.clone())
            .chain(self.statuses.iter().map(|s| s.as_str().to_string()))
            .collect()
    }
}

/// Classify every canonical field as found or missing for one file.
pub fn validate(locator: &ColumnLocator, file_name: &str) -> ValidationRecord {
    let mut statuses = [FieldStatus::Missing; FIELD_COUNT];
    for field in CanonicalField::ALL {
        if locator.is_found(field) {
            statuses[field.index()] = FieldStatus::Found;
        }
    }
    ValidationRecord {
        file_name: file_name.to_string(),
        statuses,
    }
}

/// Append a record to the validation sink. Any write error is returned to the
/// caller, which treats it as fatal for the run.
pub fn record<W: Write>(sink: &CsvSink<W>, rec: &ValidationRecord) -> Result<()> {
    let missing = rec.missing_count();
    if missing > 0 {
        let names: Vec<&str> = CanonicalField::ALL
            .iter()
            .filter(|f| rec.status(**f) == FieldStatus::Missing)
            .map(|f| f.name())
            .collect();
        warn!(file = %rec.file_name, missing = ?names, "missing canonical fields");
    } else {
        debug!(file = %rec.file_name, "all canonical fields found");
    }
    sink.append(&rec.to_record())
        .with_context(|| format!("recording validation for {}", rec.file_name))
}
