//! FlowMesh flow records and live flow tables.
//!
//! A flow is the unit of observation: a sampled conversation seen at one
//! capture point, identified by a stable UUID and joined back to the
//! topology graph through node TIDs. This crate holds the record type,
//! the in-memory `FlowSet` operations the query language pushes down,
//! the per-capture-point tables on the agent, and the client pool that
//! ships records towards the analyzer.

mod client;
mod flow;
mod flowset;
mod table;

pub use client::{FlowClientPool, FlowSender, LocalTableClient, TableClient};
pub use flow::{node_filter, Flow, FlowError, FlowLayer, FlowMetric, FlowResult, TimedMetric};
pub use flowset::FlowSet;
pub use table::{Table, TableAllocator};
