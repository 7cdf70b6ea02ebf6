//! Flow traversal integration tests.
//!
//! Exercises the graph↔flow joins against live tables and the pushdown
//! into a storage adapter under a time-sliced context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_core::{CaptureTypeRegistry, Filter, Range, SearchQuery, SortOrder};
use mesh_flow::{
    Flow, FlowLayer, FlowSet, LocalTableClient, TableAllocator, TimedMetric,
};
use mesh_graph::{metadata, Graph};
use mesh_query::{execute, QueryError, TraversalContext, TraversalValue};
use mesh_storage::{FlowStorage, MemoryFlowStorage, StorageResult};

const EXPIRE_MS: i64 = 30_000;

/// Storage stub recording the queries it receives.
#[derive(Default)]
struct RecordingStorage {
    flow_queries: Mutex<Vec<SearchQuery>>,
    metric_queries: Mutex<Vec<(SearchQuery, Filter)>>,
}

impl FlowStorage for RecordingStorage {
    fn store_flows(&self, _flows: &[Flow]) -> StorageResult<()> {
        Ok(())
    }

    fn search_flows(&self, query: &SearchQuery) -> StorageResult<FlowSet> {
        self.flow_queries.lock().unwrap().push(query.clone());
        Ok(FlowSet::default())
    }

    fn search_metrics(
        &self,
        query: &SearchQuery,
        range: &Filter,
    ) -> StorageResult<HashMap<String, Vec<TimedMetric>>> {
        self.metric_queries
            .lock()
            .unwrap()
            .push((query.clone(), range.clone()));
        Ok(HashMap::new())
    }
}

fn test_graph() -> Arc<Graph> {
    let graph = Arc::new(Graph::memory("agent-1"));
    let mut w = graph.write();
    w.add_node(mesh_graph::Node::new(
        "n-a".into(),
        "agent-1",
        metadata! {"Type" => "veth", "TID" => "a"},
    ));
    w.add_node(mesh_graph::Node::new(
        "n-b".into(),
        "agent-1",
        metadata! {"Type" => "veth", "TID" => "b"},
    ));
    w.add_node(mesh_graph::Node::new(
        "n-c".into(),
        "agent-1",
        metadata! {"Type" => "veth", "TID" => "c"},
    ));
    drop(w);
    graph
}

fn flow(uuid: &str, node_tid: &str, a_tid: &str, b_tid: &str, last: i64) -> Flow {
    Flow {
        uuid: uuid.to_string(),
        node_tid: node_tid.to_string(),
        a_node_tid: a_tid.to_string(),
        b_node_tid: b_tid.to_string(),
        network: Some(FlowLayer::new("IPV4", "10.0.0.1", "10.0.0.2")),
        transport: Some(FlowLayer::new("TCP", "44444", "80")),
        start: 0,
        last,
        ..Flow::default()
    }
}

fn live_context(graph: Arc<Graph>) -> TraversalContext {
    let allocator = Arc::new(TableAllocator::new("agent-1", Duration::from_secs(600)));
    let table = allocator.alloc("a");
    table.ingest(flow("f1", "a", "a", "b", 10));
    table.ingest(flow("f2", "a", "a", "c", 20));

    TraversalContext {
        graph,
        table_client: Some(Arc::new(LocalTableClient::new(allocator))),
        storage: None,
        capture_types: Arc::new(CaptureTypeRegistry::default()),
        flow_expire_ms: EXPIRE_MS,
    }
}

fn stored_context(graph: Arc<Graph>, storage: Arc<dyn FlowStorage>) -> TraversalContext {
    TraversalContext {
        graph,
        table_client: None,
        storage: Some(storage),
        capture_types: Arc::new(CaptureTypeRegistry::default()),
        flow_expire_ms: EXPIRE_MS,
    }
}

fn tids(value: TraversalValue) -> Vec<String> {
    match value {
        TraversalValue::Vertices(nodes) => {
            let mut tids: Vec<String> = nodes
                .iter()
                .filter_map(|n| n.tid().map(str::to_string))
                .collect();
            tids.sort();
            tids
        }
        other => panic!("expected vertices, got {other:?}"),
    }
}

#[test]
fn flows_nodes_returns_all_referenced_nodes() {
    let ctx = live_context(test_graph());
    // f1 references (a, a, b), f2 references (a, a, c); duplicates are
    // kept for callers to chain .Dedup().
    let value = execute(&ctx, "G.V().Has('TID', 'a').Flows().Nodes()").unwrap();
    assert_eq!(tids(value), vec!["a", "a", "a", "a", "b", "c"]);

    let value = execute(&ctx, "G.V().Has('TID', 'a').Flows().Nodes().Dedup()").unwrap();
    assert_eq!(tids(value), vec!["a", "b", "c"]);
}

#[test]
fn hops_and_capture_node_return_capture_points() {
    let ctx = live_context(test_graph());
    for query in [
        "G.V().Has('TID', 'a').Flows().Hops()",
        "G.V().Has('TID', 'a').Flows().CaptureNode()",
    ] {
        let value = execute(&ctx, query).unwrap();
        assert_eq!(tids(value), vec!["a", "a"]);
    }
}

#[test]
fn unknown_and_wildcard_tids_are_skipped() {
    let graph = test_graph();
    let allocator = Arc::new(TableAllocator::new("agent-1", Duration::from_secs(600)));
    let table = allocator.alloc("a");
    table.ingest(flow("f1", "a", "", "*", 10));

    let ctx = TraversalContext {
        graph,
        table_client: Some(Arc::new(LocalTableClient::new(allocator))),
        storage: None,
        capture_types: Arc::new(CaptureTypeRegistry::default()),
        flow_expire_ms: EXPIRE_MS,
    };
    let value = execute(&ctx, "G.V().Has('TID', 'a').Flows().Nodes()").unwrap();
    assert_eq!(tids(value), vec!["a"]);
}

#[test]
fn has_on_layer_matches_either_endpoint() {
    let ctx = live_context(test_graph());

    let value = execute(
        &ctx,
        "G.V().Has('TID', 'a').Flows().Has('Network', '10.0.0.2')",
    )
    .unwrap();
    match value {
        TraversalValue::Flows(set) => assert_eq!(set.len(), 2),
        other => panic!("expected flows, got {other:?}"),
    }

    let value = execute(
        &ctx,
        "G.V().Has('TID', 'a').Flows().Has('Network', '10.9.9.9')",
    )
    .unwrap();
    match value {
        TraversalValue::Flows(set) => assert!(set.is_empty()),
        other => panic!("expected flows, got {other:?}"),
    }
}

#[test]
fn time_slice_pushes_one_search_flows_query() {
    let storage = Arc::new(RecordingStorage::default());
    let ctx = stored_context(test_graph(), storage.clone());

    execute(
        &ctx,
        "G.Context(1000, 2000).V().Has('TID', 'a').Flows().Has('Transport', 'tcp').Sort().Limit(10)",
    )
    .unwrap();

    let queries = storage.flow_queries.lock().unwrap();
    assert_eq!(queries.len(), 1);
    let query = &queries[0];

    // AND(transport=tcp, ActiveIn([1000 - expire, 2000]), node=a).
    let expected_filter = Filter::and(vec![
        Filter::or(vec![
            Filter::term_string("Transport.A", "tcp"),
            Filter::term_string("Transport.B", "tcp"),
        ]),
        Filter::active_in(Range::new(1000 - EXPIRE_MS, 2000), ""),
        Filter::or(vec![
            Filter::term_string("NodeTID", "a"),
            Filter::term_string("ANodeTID", "a"),
            Filter::term_string("BNodeTID", "a"),
        ]),
    ]);
    assert_eq!(query.filter, Some(expected_filter));
    assert!(query.sort);
    assert_eq!(query.sort_by.as_deref(), Some("Last"));
    assert_eq!(query.sort_order, SortOrder::Ascending);
    assert_eq!(query.pagination, Some(Range::new(0, 10)));

    assert!(storage.metric_queries.lock().unwrap().is_empty());
}

#[test]
fn time_slice_with_metrics_queries_the_metric_index() {
    let storage = Arc::new(RecordingStorage::default());
    let ctx = stored_context(test_graph(), storage.clone());

    execute(
        &ctx,
        "G.Context(1000, 2000).V().Has('TID', 'a').Flows().Metrics()",
    )
    .unwrap();

    assert!(storage.flow_queries.lock().unwrap().is_empty());
    let queries = storage.metric_queries.lock().unwrap();
    assert_eq!(queries.len(), 1);

    let (query, range) = &queries[0];
    assert!(query.sort);
    assert_eq!(query.sort_order, SortOrder::Ascending);
    assert_eq!(range, &Filter::included_in(Range::new(1000, 2000), ""));
}

#[test]
fn point_time_slice_keeps_only_upper_bound() {
    let storage = Arc::new(RecordingStorage::default());
    let ctx = stored_context(test_graph(), storage.clone());

    execute(&ctx, "G.Context(2000).V().Has('TID', 'a').Flows().Metrics()").unwrap();

    let queries = storage.metric_queries.lock().unwrap();
    let (_, range) = &queries[0];
    assert_eq!(range, &Filter::included_in(Range::new(0, 2000), ""));
}

#[test]
fn broken_chain_applies_filter_in_memory() {
    let storage = Arc::new(RecordingStorage::default());
    let ctx = stored_context(test_graph(), storage.clone());

    // The second Limit is not absorbable, so the trailing Has must not
    // reach the storage filter.
    execute(
        &ctx,
        "G.Context(1000, 2000).V().Has('TID', 'a').Flows().Limit(10).Limit(5).Has('Transport', 'tcp')",
    )
    .unwrap();

    let queries = storage.flow_queries.lock().unwrap();
    assert_eq!(queries.len(), 1);
    let pushed = format!("{:?}", queries[0].filter);
    assert!(!pushed.contains("Transport"));
}

#[test]
fn aggregates_merges_buckets_across_flows() {
    let graph = test_graph();
    let storage = Arc::new(MemoryFlowStorage::new());

    let mut f1 = flow("f1", "a", "a", "b", 2000);
    f1.start = 1000;
    f1.metric.ab_packets = 3;
    let mut f2 = flow("f2", "a", "a", "c", 2000);
    f2.start = 1000;
    f2.metric.ab_packets = 4;
    storage.store_flows(&[f1, f2]).unwrap();

    let ctx = stored_context(graph, storage);
    let value = execute(
        &ctx,
        "G.Context(1000, 2000).V().Has('TID', 'a').Flows().Metrics().Aggregates()",
    )
    .unwrap();

    match value {
        TraversalValue::Metrics(metrics) => {
            let samples = &metrics["Aggregated"];
            assert_eq!(samples.len(), 1);
            assert_eq!(samples[0].metric.ab_packets, 7);
            assert_eq!((samples[0].start, samples[0].last), (1000, 2000));
        }
        other => panic!("expected metrics, got {other:?}"),
    }
}

#[test]
fn live_metrics_use_update_window_or_lifetime() {
    let graph = test_graph();
    let allocator = Arc::new(TableAllocator::new("agent-1", Duration::from_secs(600)));
    let table = allocator.alloc("a");

    // f1 has an update window, f2 only its lifetime.
    let mut f1 = flow("f1", "a", "a", "b", 20);
    f1.last_update_start = 10;
    f1.last_update_last = 20;
    f1.last_update_metric.ab_packets = 2;
    table.ingest(f1);
    let mut f2 = flow("f2", "a", "a", "c", 30);
    f2.metric.ab_packets = 9;
    table.ingest(f2);

    let ctx = TraversalContext {
        graph,
        table_client: Some(Arc::new(LocalTableClient::new(allocator))),
        storage: None,
        capture_types: Arc::new(CaptureTypeRegistry::default()),
        flow_expire_ms: EXPIRE_MS,
    };

    match execute(&ctx, "G.V().Has('TID', 'a').Flows().Metrics()").unwrap() {
        TraversalValue::Metrics(metrics) => {
            assert_eq!(metrics["f1"][0].start, 10);
            assert_eq!(metrics["f1"][0].metric.ab_packets, 2);
            assert_eq!(metrics["f2"][0].start, 0);
            assert_eq!(metrics["f2"][0].metric.ab_packets, 9);
        }
        other => panic!("expected metrics, got {other:?}"),
    }
}

#[test]
fn sum_surfaces_missing_fields_property_values_omits_them() {
    let ctx = live_context(test_graph());

    match execute(&ctx, "G.V().Flows().Sum('Metric.ABBytes')").unwrap() {
        TraversalValue::Value(v) => assert_eq!(v, serde_json::json!(0)),
        other => panic!("expected value, got {other:?}"),
    }

    // Sum over something that is not a metric field is invalid.
    assert!(matches!(
        execute(&ctx, "G.V().Flows().Sum('Network.A')"),
        Err(QueryError::InvalidArgument(_))
    ));

    match execute(&ctx, "G.V().Flows().PropertyValues('Link.A')").unwrap() {
        // Neither test flow has a Link layer: all entries omitted.
        TraversalValue::Value(v) => assert_eq!(v, serde_json::json!([])),
        other => panic!("expected value, got {other:?}"),
    }
}

#[test]
fn non_capture_nodes_are_filtered_before_lookup() {
    let graph = Arc::new(Graph::memory("agent-1"));
    graph.write().add_node(mesh_graph::Node::new(
        "n-x".into(),
        "agent-1",
        metadata! {"Type" => "vlan", "TID" => "x"},
    ));

    let allocator = Arc::new(TableAllocator::new("agent-1", Duration::from_secs(600)));
    allocator.alloc("x").ingest(flow("f1", "x", "", "", 10));

    let ctx = TraversalContext {
        graph,
        table_client: Some(Arc::new(LocalTableClient::new(allocator))),
        storage: None,
        capture_types: Arc::new(CaptureTypeRegistry::default()),
        flow_expire_ms: EXPIRE_MS,
    };

    // vlan is not capture-eligible, so no table is consulted.
    match execute(&ctx, "G.V().Has('TID', 'x').Flows()").unwrap() {
        TraversalValue::Flows(set) => assert!(set.is_empty()),
        other => panic!("expected flows, got {other:?}"),
    }
}
