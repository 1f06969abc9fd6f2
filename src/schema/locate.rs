// src/schema/locate.rs

use tracing::trace;

use super::fields::{CanonicalField, FIELD_COUNT};

/// Where each canonical field lives in one sheet's native column order.
///
/// Built once from a sheet's header row and only read afterwards. A field
/// that never appeared in the header has no position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnLocator {
    positions: [Option<usize>; FIELD_COUNT],
}

impl ColumnLocator {
    /// Scan a header row. When a field name repeats, the first column wins.
    pub fn from_headers<S: AsRef<str>>(headers: &[S]) -> Self {
        let mut positions = [None; FIELD_COUNT];
        for (col, cell) in headers.iter().enumerate() {
            let Some(field) = CanonicalField::from_header(cell.as_ref()) else {
                continue;
            };
            let slot = &mut positions[field.index()];
            match slot {
                None => *slot = Some(col),
                Some(first) => {
                    trace!(field = field.name(), first = *first, ignored = col, "duplicate header");
                }
            }
        }
        Self { positions }
    }

    pub fn position(&self, field: CanonicalField) -> Option<usize> {
        self.positions[field.index()]
    }

    pub fn is_found(&self, field: CanonicalField) -> bool {
        self.position(field).is_some()
    }

    /// Fields with no known position, in canonical order.
    pub fn missing(&self) -> Vec<CanonicalField> {
        CanonicalField::ALL
            .iter()
            .copied()
            .filter(|f| !self.is_found(*f))
            .collect()
    }

    /// Reorder a native row into canonical order.
    ///
    /// Always returns exactly nine values. An absent field, or a row too
    /// short to reach the located column, yields an empty string.
    pub fn reorder(&self, row: &[String]) -> Vec<String> {
        self.positions
            .iter()
            .map(|pos| {
                pos.and_then(|i| row.get(i))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Map from field name to position, for reports.
    pub fn to_named(&self) -> Vec<(&'static str, Option<usize>)> {
        CanonicalField::ALL
            .iter()
            .map(|f| (f.name(), self.position(*f)))
            .collect()
    }
}
