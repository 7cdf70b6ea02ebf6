//! Analyzer mode — aggregates agent graphs and persists flows.
//!
//! In this mode, the daemon:
//! 1. Mirrors the replicated node/edge subtrees into its own graph
//! 2. Opens the durable flow store (redb on disk, memory otherwise)
//! 3. Serves the traversal runtime over both (transport is external)

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use mesh_config::MemoryConfigStore;
use mesh_core::config::MeshConfig;
use mesh_core::CaptureTypeRegistry;
use mesh_graph::Graph;
use mesh_query::TraversalContext;
use mesh_storage::{FlowStorage, MemoryFlowStorage, RedbFlowStorage};

use crate::replication::spawn_graph_mirror;

pub async fn run_analyzer(config: MeshConfig) -> anyhow::Result<()> {
    let host = config.host_name();
    info!(%host, "meshd starting in analyzer mode");

    let graph = Arc::new(Graph::memory(host));

    let storage: Arc<dyn FlowStorage> = match config.storage_path() {
        Some(path) => {
            let storage = RedbFlowStorage::open(Path::new(path))?;
            info!(%path, "durable flow store opened");
            Arc::new(storage)
        }
        None => {
            info!("no storage path configured, using in-memory flow store");
            Arc::new(MemoryFlowStorage::new())
        }
    };

    let store = Arc::new(MemoryConfigStore::new());
    let mirror = spawn_graph_mirror(graph.clone(), store);
    info!("graph mirror running");

    // The traversal context the (external) query transport executes
    // against.
    let _ctx = TraversalContext {
        graph,
        table_client: None,
        storage: Some(storage),
        capture_types: Arc::new(CaptureTypeRegistry::default()),
        flow_expire_ms: config.flow_expire_secs() as i64 * 1000,
    };

    info!("analyzer ready");
    tokio::signal::ctrl_c().await?;
    info!("analyzer shutting down");

    mirror.abort();
    Ok(())
}
