//! FlowMesh topology graph engine.
//!
//! An in-memory labelled multigraph behind a pluggable backend. The
//! engine validates mutations, dispatches events to listeners under the
//! writer lock, and offers the read-side traversals the query language
//! and the capture control plane are built on.

mod backend;
mod element;
mod graph;
pub mod topology;
mod updater;

pub use backend::{GraphBackend, MemoryBackend};
pub use element::{matches_filter, Edge, GraphElementRef, Identifier, Metadata, Node};
pub use graph::{
    Graph, GraphError, GraphEventListener, GraphReadGuard, GraphReadOps, GraphResult, GraphView,
    GraphWriteGuard, ListenerId, MetadataTransaction,
};
pub use updater::{NodeEnhancer, NodeUpdater};

/// Build a `Metadata` map from `key => value` pairs.
///
/// Values take anything `serde_json::Value` converts from.
#[macro_export]
macro_rules! metadata {
    () => { $crate::Metadata::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut m = $crate::Metadata::new();
        $(m.insert($key.to_string(), ::serde_json::Value::from($value));)+
        m
    }};
}
