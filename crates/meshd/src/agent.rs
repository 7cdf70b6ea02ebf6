//! Agent mode — runs on every observed host.
//!
//! In this mode, the daemon:
//! 1. Builds the local topology graph (fed by external topology probes)
//! 2. Publishes graph mutations into the replicated config store
//! 3. Watches capture specs and reconciles flow probe registrations
//! 4. Ticks the live flow tables (update windows, expiry)
//! 5. Ships captured flows towards the analyzer via the client pool

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use mesh_capture::{CaptureManager, FlowProbeHandler, ProbeBundle};
use mesh_config::MemoryConfigStore;
use mesh_core::config::MeshConfig;
use mesh_core::CaptureTypeRegistry;
use mesh_flow::{FlowClientPool, TableAllocator};
use mesh_graph::Graph;

use crate::replication::GraphPublisher;

pub async fn run_agent(config: MeshConfig) -> anyhow::Result<()> {
    let host = config.host_name();
    info!(%host, "meshd starting in agent mode");

    let graph = Arc::new(Graph::memory(host.clone()));
    let allocator = Arc::new(TableAllocator::new(
        host.clone(),
        Duration::from_secs(config.flow_expire_secs()),
    ));

    // External capture drivers register here; none are built in.
    let probes: HashMap<String, Arc<dyn FlowProbeHandler>> = HashMap::new();
    let bundle = Arc::new(ProbeBundle::new(probes));
    bundle.start();

    // Single-process store; a clustered deployment plugs its own in.
    let store = Arc::new(MemoryConfigStore::new());
    let publisher = GraphPublisher::start(&graph, store.clone());

    let manager = CaptureManager::start(
        graph.clone(),
        bundle.clone(),
        allocator.clone(),
        Arc::new(CaptureTypeRegistry::default()),
        store,
    )?;
    info!("capture manager wired");

    let pool = Arc::new(FlowClientPool::new());

    // Table maintenance: update windows and expiry.
    let tick_allocator = allocator.clone();
    let update_interval = Duration::from_secs(config.flow_update_secs());
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(update_interval);
        loop {
            interval.tick().await;
            let now_ms = epoch_ms();
            tick_allocator.update_all(now_ms);
            tick_allocator.expire_all(now_ms);
        }
    });

    info!("agent ready");
    tokio::signal::ctrl_c().await?;
    info!("agent shutting down");

    ticker.abort();
    manager.stop().await;
    publisher.stop(&graph).await;
    bundle.stop();
    pool.shutdown().await;

    Ok(())
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
