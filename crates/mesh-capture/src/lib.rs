//! FlowMesh capture control plane.
//!
//! Captures are user-declared intents to sample packets on every graph
//! node matching a query. They live in the replicated config store; the
//! capture manager watches them and the graph, resolves each query to
//! concrete nodes, and reconciles probe registrations through the probe
//! bundle.

mod capture;
mod manager;
mod probe;

use thiserror::Error;

use mesh_config::ConfigStoreError;

pub use capture::{create_capture, Capture};
pub use manager::CaptureManager;
pub use probe::{FlowProbeHandler, ProbeBundle};

/// Result type alias for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Errors raised by the capture control plane.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The capture names no type, or one no node type admits.
    #[error("bad capture type: {0:?}")]
    BadCaptureType(String),

    #[error("probe error: {0}")]
    Probe(String),

    #[error(transparent)]
    Config(#[from] ConfigStoreError),
}
