//! End-to-end: agent topology replicated to the analyzer, captures
//! reconciled, flows persisted and queried back with graph joins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_capture::{Capture, CaptureManager, CaptureResult, FlowProbeHandler, ProbeBundle};
use mesh_config::{ConfigStore, MemoryConfigStore, ResourceHandler};
use mesh_core::CaptureTypeRegistry;
use mesh_flow::{Flow, FlowLayer, Table, TableAllocator};
use mesh_graph::{metadata, Graph, GraphReadOps, Node};
use mesh_query::{execute, TraversalContext, TraversalValue};
use mesh_storage::{FlowStorage, MemoryFlowStorage};

/// Probe that feeds one synthetic flow into each table it registers.
#[derive(Default)]
struct SyntheticProbe {
    tables: Mutex<Vec<Arc<Table>>>,
}

impl FlowProbeHandler for SyntheticProbe {
    fn start(&self) {}
    fn stop(&self) {}

    fn register_probe(
        &self,
        node: &Node,
        _capture: &Capture,
        table: Arc<Table>,
    ) -> CaptureResult<()> {
        let tid = node.tid().unwrap_or_default();
        let mut flow = Flow::new(
            "Ethernet/IPv4/TCP",
            None,
            Some(FlowLayer::new("IPV4", "192.168.0.10", "192.168.0.20")),
            Some(FlowLayer::new("TCP", "51000", "443")),
            tid,
            1_000,
        );
        flow.a_node_tid = tid.to_string();
        flow.b_node_tid = "*".to_string();
        flow.metric.ab_packets = 12;
        flow.last = 2_000;
        table.ingest(flow);
        self.tables.lock().unwrap().push(table);
        Ok(())
    }

    fn unregister_probe(&self, _node: &Node) -> CaptureResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn capture_to_query_round_trip() {
    // Agent side: a veth on the local graph.
    let graph = Arc::new(Graph::memory("agent-1"));
    graph.write().add_node(Node::new(
        "n-veth".into(),
        "agent-1",
        metadata! {"Type" => "veth", "Name" => "veth0", "TID" => "tid-veth"},
    ));

    let probe = Arc::new(SyntheticProbe::default());
    let mut probes: HashMap<String, Arc<dyn FlowProbeHandler>> = HashMap::new();
    probes.insert("afpacket".to_string(), probe.clone());

    let allocator = Arc::new(TableAllocator::new("agent-1", Duration::from_secs(600)));
    let store = Arc::new(MemoryConfigStore::new());

    // A capture arrives through the store.
    let handler = ResourceHandler::<Capture>::new(store.clone());
    let mut capture = Capture::new("G.V().Has('Type', 'veth')", "tcp port 443", "afpacket");
    capture.uuid = "c1".to_string();
    handler.create(&capture).unwrap();

    let manager = CaptureManager::start(
        graph.clone(),
        Arc::new(ProbeBundle::new(probes)),
        allocator.clone(),
        Arc::new(CaptureTypeRegistry::default()),
        store,
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.registered_nodes("c1").len(), 1);

    // Live query over the agent tables, joining back to the graph.
    let ctx = TraversalContext {
        graph: graph.clone(),
        table_client: Some(Arc::new(mesh_flow::LocalTableClient::new(
            allocator.clone(),
        ))),
        storage: None,
        capture_types: Arc::new(CaptureTypeRegistry::default()),
        flow_expire_ms: 30_000,
    };

    match execute(&ctx, "G.V().Has('Name', 'veth0').Flows().CaptureNode()").unwrap() {
        TraversalValue::Vertices(nodes) => {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].tid(), Some("tid-veth"));
        }
        other => panic!("expected vertices, got {other:?}"),
    }

    // Analyzer side: persist the flows and answer a time-sliced query.
    let storage = Arc::new(MemoryFlowStorage::new());
    let live = allocator.collect(None, None);
    storage.store_flows(&live.flows).unwrap();

    let stored_ctx = TraversalContext {
        graph,
        table_client: None,
        storage: Some(storage),
        capture_types: Arc::new(CaptureTypeRegistry::default()),
        flow_expire_ms: 30_000,
    };

    match execute(
        &stored_ctx,
        "G.Context(1000, 3000).V().Flows().Has('Transport.B', '443')",
    )
    .unwrap()
    {
        TraversalValue::Flows(set) => {
            assert_eq!(set.len(), 1);
            assert_eq!(set.flows[0].node_tid, "tid-veth");
        }
        other => panic!("expected flows, got {other:?}"),
    }

    manager.stop().await;
}

#[tokio::test]
async fn analyzer_view_follows_agent_topology() {
    let agent_graph = Arc::new(Graph::memory("agent-1"));
    let store = Arc::new(MemoryConfigStore::new());

    // The agent publishes, the analyzer mirrors; both ends only see the
    // store.
    let veth = Node::new(
        "n1".into(),
        "agent-1",
        metadata! {"Type" => "veth", "TID" => "t1"},
    );
    store
        .set(
            "/node/agent-1/n1",
            serde_json::to_value(&veth).unwrap(),
        )
        .unwrap();

    let analyzer_graph = Arc::new(Graph::memory("analyzer"));
    {
        // Baseline application, as the analyzer mirror does it.
        let entries = mesh_config::ConfigStore::list(store.as_ref(), "/node/").unwrap();
        let mut w = analyzer_graph.write();
        for (_, value) in entries {
            let node: Node = serde_json::from_value(value).unwrap();
            w.add_node(node);
        }
    }

    let mirrored = analyzer_graph.read().get_node(&"n1".into()).unwrap();
    assert_eq!(mirrored.host, "agent-1");
    assert_eq!(mirrored.tid(), Some("t1"));
    assert_eq!(mirrored, veth);
}
