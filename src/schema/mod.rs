pub mod fields;
pub mod locate;
pub mod validate;

pub use fields::{CanonicalField, AGGREGATE_HEADER, FIELD_COUNT, VALIDATION_HEADER};
pub use locate::ColumnLocator;
pub use validate::{validate, FieldStatus, ValidationRecord};
