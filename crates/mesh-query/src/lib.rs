//! FlowMesh traversal runtime.
//!
//! A Gremlin-like dialect over the topology graph, extended with flow
//! steps that join stored or live flow records back to graph nodes via
//! per-flow TIDs. Filter, sort, dedup and pagination adjacent to
//! `Flows()` are pushed down into the search query; a time slice on the
//! traversal redirects flow retrieval to durable storage.

mod exec;
mod parser;
mod token;

use thiserror::Error;

use mesh_flow::FlowError;
use mesh_storage::StorageError;

pub use exec::{execute, TraversalContext, TraversalValue};
pub use parser::{parse, Step, StepKind, StepParam};

/// Result type alias for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors raised while parsing or executing a traversal.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("syntax error at {0}: {1}")]
    Syntax(usize, String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A step was applied to an incompatible upstream value.
    #[error("step {0} cannot follow the previous step")]
    Execution(String),

    #[error("field not found")]
    FieldNotFound,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Flow(#[from] FlowError),
}
