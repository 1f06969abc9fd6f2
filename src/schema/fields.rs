// src/schema/fields.rs

use once_cell::sync::Lazy;

/// The nine billing columns every output row carries, in output order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalField {
    SatAcct,
    BillStatus,
    HostBillFrom,
    HostBillTo,
    TransferredKwh,
    BankedPriorMonth,
    AllocationPercent,
    Applied,
    BankedCarryOver,
}

/// Number of canonical fields.
pub const FIELD_COUNT: usize = 9;

impl CanonicalField {
    /// All fields in canonical order.
    pub const ALL: [CanonicalField; FIELD_COUNT] = [
        CanonicalField::SatAcct,
        CanonicalField::BillStatus,
        CanonicalField::HostBillFrom,
        CanonicalField::HostBillTo,
        CanonicalField::TransferredKwh,
        CanonicalField::BankedPriorMonth,
        CanonicalField::AllocationPercent,
        CanonicalField::Applied,
        CanonicalField::BankedCarryOver,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CanonicalField::SatAcct => "Sat Acct",
            CanonicalField::BillStatus => "Bill Status",
            CanonicalField::HostBillFrom => "Host Bill From",
            CanonicalField::HostBillTo => "Host Bill To",
            CanonicalField::TransferredKwh => "Transferred kWh",
            CanonicalField::BankedPriorMonth => "Banked Prior Month",
            CanonicalField::AllocationPercent => "Allocation %",
            CanonicalField::Applied => "Applied",
            CanonicalField::BankedCarryOver => "Banked Carry Over",
        }
    }

    /// Position of this field in canonical order.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Case-insensitive lookup of a header cell. Surrounding whitespace is ignored.
    pub fn from_header(cell: &str) -> Option<Self> {
        let cell = cell.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(cell))
    }
}

/// Header record of the aggregate output.
pub static AGGREGATE_HEADER: Lazy<Vec<String>> = Lazy::new(|| {
    CanonicalField::ALL
        .iter()
        .map(|f| f.name().to_string())
        .collect()
});

/// Header record of the validation output: the file name column, then every field.
pub static VALIDATION_HEADER: Lazy<Vec<String>> = Lazy::new(|| {
    std::iter::once("File Name".to_string())
        .chain(AGGREGATE_HEADER.iter().cloned())
        .collect()
});
