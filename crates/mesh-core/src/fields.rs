//! Dotted-path field access over nested records.

use thiserror::Error;

/// Errors raised by field accessors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("field not found")]
    NotFound,

    #[error("field has incompatible type")]
    WrongType,
}

/// Read-only access to named fields of a record.
///
/// Paths use dot notation following the JSON structure verbatim, e.g.
/// `Network.A` or `Metric.ABBytes`. A missing segment at any depth is
/// `FieldError::NotFound`.
pub trait FieldGetter {
    fn get_field_int64(&self, path: &str) -> Result<i64, FieldError>;

    fn get_field_string(&self, path: &str) -> Result<String, FieldError>;
}
