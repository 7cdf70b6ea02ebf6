//! Time slices for historical queries.

use serde::{Deserialize, Serialize};

/// A `[start, last]` window in milliseconds since the epoch.
///
/// A traversal context carrying a time slice is answered from durable
/// flow storage instead of the live agent tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlice {
    pub start: i64,
    pub last: i64,
}

impl TimeSlice {
    pub fn new(start: i64, last: i64) -> Self {
        Self { start, last }
    }

    /// A single point in time.
    pub fn at(t: i64) -> Self {
        Self { start: t, last: t }
    }
}
