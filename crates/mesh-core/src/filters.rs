//! Filter tree and search queries.
//!
//! Filters are built by traversal steps and evaluated either in memory
//! against live flow tables or handed to a storage backend as part of a
//! `SearchQuery`. Evaluation goes through the `FieldGetter` contract, so
//! the same tree applies to flows and to metric samples.

use serde::{Deserialize, Serialize};

use crate::fields::FieldGetter;

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    /// Parse a sort order keyword (`ASC`/`DESC`, case-insensitive).
    pub fn parse(s: &str) -> Option<SortOrder> {
        match s.to_uppercase().as_str() {
            "ASC" => Some(SortOrder::Ascending),
            "DESC" => Some(SortOrder::Descending),
            _ => None,
        }
    }
}

/// A closed integer interval, in the unit of the field it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Range {
    pub from: i64,
    pub to: i64,
}

impl Range {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }
}

/// A predicate over a record.
///
/// `ActiveIn` and `IncludedIn` interpret the record as a lifetime: they
/// read `<prefix>Start` and `<prefix>Last` and compare against the range.
/// A record is active in a range when its lifetime overlaps it, included
/// when its lifetime lies entirely inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    TermString { key: String, value: String },
    TermInt { key: String, value: i64 },
    TermBool { key: String, value: bool },
    Gt { key: String, value: i64 },
    Gte { key: String, value: i64 },
    Lt { key: String, value: i64 },
    Lte { key: String, value: i64 },
    Regex { key: String, pattern: String },
    ActiveIn { range: Range, prefix: String },
    IncludedIn { range: Range, prefix: String },
}

impl Filter {
    /// AND of the given filters, flattening nested ANDs and dropping the
    /// wrapper for a single operand.
    pub fn and(filters: Vec<Filter>) -> Filter {
        let mut flat = Vec::with_capacity(filters.len());
        for f in filters {
            match f {
                Filter::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Filter::And(flat)
        }
    }

    pub fn or(mut filters: Vec<Filter>) -> Filter {
        if filters.len() == 1 {
            filters.remove(0)
        } else {
            Filter::Or(filters)
        }
    }

    pub fn term_string(key: &str, value: &str) -> Filter {
        Filter::TermString {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn term_int(key: &str, value: i64) -> Filter {
        Filter::TermInt {
            key: key.to_string(),
            value,
        }
    }

    pub fn term_bool(key: &str, value: bool) -> Filter {
        Filter::TermBool {
            key: key.to_string(),
            value,
        }
    }

    pub fn active_in(range: Range, prefix: &str) -> Filter {
        Filter::ActiveIn {
            range,
            prefix: prefix.to_string(),
        }
    }

    pub fn included_in(range: Range, prefix: &str) -> Filter {
        Filter::IncludedIn {
            range,
            prefix: prefix.to_string(),
        }
    }

    /// Evaluate the filter against a record.
    pub fn matches(&self, record: &dyn FieldGetter) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(record)),
            Filter::TermString { key, value } => record
                .get_field_string(key)
                .map(|v| v == *value)
                .unwrap_or(false),
            Filter::TermInt { key, value } => record
                .get_field_int64(key)
                .map(|v| v == *value)
                .unwrap_or(false),
            Filter::TermBool { key, value } => {
                // Booleans are carried as 0/1 on the int accessor.
                record
                    .get_field_int64(key)
                    .map(|v| (v != 0) == *value)
                    .unwrap_or(false)
            }
            Filter::Gt { key, value } => record
                .get_field_int64(key)
                .map(|v| v > *value)
                .unwrap_or(false),
            Filter::Gte { key, value } => record
                .get_field_int64(key)
                .map(|v| v >= *value)
                .unwrap_or(false),
            Filter::Lt { key, value } => record
                .get_field_int64(key)
                .map(|v| v < *value)
                .unwrap_or(false),
            Filter::Lte { key, value } => record
                .get_field_int64(key)
                .map(|v| v <= *value)
                .unwrap_or(false),
            Filter::Regex { key, pattern } => match record.get_field_string(key) {
                Ok(v) => regex::Regex::new(pattern)
                    .map(|re| re.is_match(&v))
                    .unwrap_or(false),
                Err(_) => false,
            },
            Filter::ActiveIn { range, prefix } => {
                let (start, last) = match lifetime(record, prefix) {
                    Some(l) => l,
                    None => return false,
                };
                start <= range.to && last >= range.from
            }
            Filter::IncludedIn { range, prefix } => {
                let (start, last) = match lifetime(record, prefix) {
                    Some(l) => l,
                    None => return false,
                };
                start >= range.from && last <= range.to
            }
        }
    }
}

fn lifetime(record: &dyn FieldGetter, prefix: &str) -> Option<(i64, i64)> {
    let start = record.get_field_int64(&format!("{prefix}Start")).ok()?;
    let last = record.get_field_int64(&format!("{prefix}Last")).ok()?;
    Some((start, last))
}

/// A query pushed down to a flow table or storage backend.
///
/// Backends must apply dedup before pagination and keep sorts stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SearchQuery {
    pub filter: Option<Filter>,
    pub pagination: Option<Range>,
    pub dedup: bool,
    pub dedup_by: Option<String>,
    pub sort: bool,
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
}

impl SearchQuery {
    /// AND an additional filter into the query.
    pub fn and_filter(&mut self, filter: Filter) {
        self.filter = Some(match self.filter.take() {
            Some(existing) => Filter::and(vec![existing, filter]),
            None => filter,
        });
    }
}
