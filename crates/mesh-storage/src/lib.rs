//! FlowMesh durable flow storage.
//!
//! The query language redirects time-sliced traversals here instead of
//! the live agent tables. Any backend satisfying `FlowStorage` works;
//! this crate ships an in-memory implementation and a redb-backed one.

mod memory;
mod redb_store;

use std::collections::HashMap;

use thiserror::Error;

use mesh_core::{Filter, SearchQuery};
use mesh_flow::{Flow, FlowError, FlowSet, TimedMetric};

pub use memory::MemoryFlowStorage;
pub use redb_store::RedbFlowStorage;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by flow storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A time-sliced query reached a deployment without a storage
    /// adapter.
    #[error("no flow storage configured")]
    NoStorageConfigured,

    /// Transient backend failure; surfaced to the caller.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// Queryable store for persisted flows and their metric samples.
///
/// Guarantees: sorts are stable, dedup happens before pagination, and
/// metric samples come back ordered by time ascending.
pub trait FlowStorage: Send + Sync {
    fn store_flows(&self, flows: &[Flow]) -> StorageResult<()>;

    fn search_flows(&self, query: &SearchQuery) -> StorageResult<FlowSet>;

    /// Per-flow metric samples for flows matching the query, keeping
    /// only samples matching the range filter.
    fn search_metrics(
        &self,
        query: &SearchQuery,
        range: &Filter,
    ) -> StorageResult<HashMap<String, Vec<TimedMetric>>>;
}

/// The metric sample a stored flow contributes: its last-update window
/// when it has one, otherwise its whole lifetime.
pub(crate) fn sample_of(flow: &Flow) -> TimedMetric {
    if flow.last_update_last != 0 || flow.last_update_start != 0 {
        TimedMetric {
            start: flow.last_update_start,
            last: flow.last_update_last,
            metric: flow.last_update_metric,
        }
    } else {
        TimedMetric {
            start: flow.start,
            last: flow.last,
            metric: flow.metric,
        }
    }
}
