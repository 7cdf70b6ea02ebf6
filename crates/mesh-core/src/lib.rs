//! Shared primitives for FlowMesh.
//!
//! Everything that more than one subsystem speaks: the filter tree and
//! search queries pushed down to flow tables and storage backends, time
//! slices and field access for flow records, and the daemon configuration.

pub mod capture_types;
pub mod config;
pub mod fields;
pub mod filters;

mod time;

pub use capture_types::CaptureTypeRegistry;
pub use fields::{FieldError, FieldGetter};
pub use filters::{Filter, Range, SearchQuery, SortOrder};
pub use time::TimeSlice;
