//! Step execution over the graph and flows.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};

use mesh_core::{
    CaptureTypeRegistry, FieldGetter, Filter, Range, SearchQuery, SortOrder, TimeSlice,
};
use mesh_flow::{node_filter, Flow, FlowMetric, FlowSet, TableClient, TimedMetric};
use mesh_graph::{Graph, GraphReadOps, Metadata, Node};
use mesh_storage::{FlowStorage, StorageError};

use crate::parser::{parse, Step, StepKind, StepParam};
use crate::{QueryError, QueryResult};

/// Everything a traversal executes against.
pub struct TraversalContext {
    pub graph: Arc<Graph>,
    /// Live flow tables; absent on storage-only analyzers.
    pub table_client: Option<Arc<dyn TableClient>>,
    /// Durable flow store; required for time-sliced traversals.
    pub storage: Option<Arc<dyn FlowStorage>>,
    pub capture_types: Arc<CaptureTypeRegistry>,
    /// Flow idle expiry in milliseconds; widens time-sliced queries.
    pub flow_expire_ms: i64,
}

/// The terminal value of a traversal.
#[derive(Debug, Clone, PartialEq)]
pub enum TraversalValue {
    Vertices(Vec<Node>),
    Flows(FlowSet),
    /// Per-flow metric samples, keyed by flow UUID.
    Metrics(HashMap<String, Vec<TimedMetric>>),
    /// Scalar or list result (Count, Sum, PropertyValues, ...).
    Value(Value),
}

/// Pipeline state between steps.
enum State {
    Start,
    Vertices(Vec<Node>),
    Flows(FlowState),
    Metrics(HashMap<String, Vec<TimedMetric>>),
    Value(Value),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Start => "Start",
            State::Vertices(_) => "Vertices",
            State::Flows(_) => "Flows",
            State::Metrics(_) => "Metrics",
            State::Value(_) => "Value",
        }
    }
}

/// The flow step's result: the retrieved set, or just the pushed-down
/// query when the next step queries the metric index directly.
struct FlowState {
    set: Option<FlowSet>,
    query: SearchQuery,
}

impl FlowState {
    fn set(&self) -> QueryResult<&FlowSet> {
        self.set
            .as_ref()
            .ok_or_else(|| QueryError::Execution("Flows".to_string()))
    }

    fn set_mut(&mut self) -> QueryResult<&mut FlowSet> {
        self.set
            .as_mut()
            .ok_or_else(|| QueryError::Execution("Flows".to_string()))
    }
}

/// Filter/sort/dedup/pagination absorbed into the flow step.
#[derive(Default)]
struct FlowPlan {
    has_params: Vec<StepParam>,
    dedup: bool,
    dedup_by: Option<String>,
    sort: bool,
    sort_by: String,
    sort_order: SortOrder,
    pagination: Option<Range>,
    metrics_next: bool,
}

const DEFAULT_SORT_BY: &str = "Last";

/// Parse and run a traversal against the context.
pub fn execute(ctx: &TraversalContext, query: &str) -> QueryResult<TraversalValue> {
    let steps = parse(query)?;
    let mut time_slice: Option<TimeSlice> = None;
    let mut state = State::Start;
    let mut i = 0;

    while i < steps.len() {
        let step = &steps[i];
        let state_name = state.name();
        let mut consumed = 1;

        match step.kind {
            StepKind::Context => {
                if !matches!(state, State::Start) {
                    return Err(step_error(step, state_name));
                }
                let start = step.params[0].as_int().unwrap_or(0);
                let last = step
                    .params
                    .get(1)
                    .and_then(StepParam::as_int)
                    .unwrap_or(start);
                time_slice = Some(TimeSlice::new(start, last));
            }

            StepKind::V => {
                if !matches!(state, State::Start) {
                    return Err(step_error(step, state_name));
                }
                let g = ctx.graph.read();
                let vertices = match step.params.first() {
                    Some(StepParam::Str(id)) => {
                        g.get_node(&id.as_str().into()).into_iter().collect()
                    }
                    Some(_) => {
                        return Err(QueryError::InvalidArgument(
                            "V expects a node ID".to_string(),
                        ))
                    }
                    None => g.get_nodes(),
                };
                state = State::Vertices(vertices);
            }

            StepKind::Has => match &mut state {
                State::Vertices(vertices) => {
                    let filter = metadata_from_params(&step.params)?;
                    vertices.retain(|n| n.matches(&filter));
                }
                State::Flows(flows) => {
                    let filter = params_to_filter(&step.params)?;
                    let set = flows.set()?.filter(&filter);
                    flows.set = Some(set);
                }
                _ => return Err(step_error(step, state_name)),
            },

            StepKind::Out | StepKind::In | StepKind::Both => match &state {
                State::Vertices(vertices) => {
                    let filter = metadata_from_params(&step.params)?;
                    state = State::Vertices(hop(ctx, vertices, &filter, step.kind));
                }
                State::Flows(flows) => {
                    let nodes = join_flow_tids(ctx, flows.set()?, &step.params, |flow| {
                        match step.kind {
                            StepKind::Out => vec![flow.b_node_tid.as_str()],
                            StepKind::In => vec![flow.a_node_tid.as_str()],
                            _ => vec![flow.a_node_tid.as_str(), flow.b_node_tid.as_str()],
                        }
                    })?;
                    state = State::Vertices(nodes);
                }
                _ => return Err(step_error(step, state_name)),
            },

            StepKind::Dedup => match &mut state {
                State::Vertices(vertices) => {
                    let mut seen = HashSet::new();
                    vertices.retain(|n| seen.insert(n.id.clone()));
                }
                State::Flows(flows) => {
                    let key = step.params.first().and_then(StepParam::as_str);
                    flows.set_mut()?.dedup(key)?;
                }
                _ => return Err(step_error(step, state_name)),
            },

            StepKind::Sort => match &mut state {
                State::Flows(flows) => {
                    let (order, key) = sort_params(&step.params);
                    flows.set_mut()?.sort(order, &key);
                }
                _ => return Err(step_error(step, state_name)),
            },

            StepKind::Range | StepKind::Limit => {
                let range = step_range(step);
                match &mut state {
                    State::Vertices(vertices) => {
                        let len = vertices.len() as i64;
                        let from = range.from.clamp(0, len) as usize;
                        let to = range.to.clamp(0, len) as usize;
                        *vertices = if from >= to {
                            Vec::new()
                        } else {
                            vertices[from..to].to_vec()
                        };
                    }
                    State::Flows(flows) => {
                        flows.set_mut()?.slice(range.from, range.to);
                    }
                    _ => return Err(step_error(step, state_name)),
                }
            }

            StepKind::Count => {
                let count = match &state {
                    State::Vertices(vertices) => vertices.len(),
                    State::Flows(flows) => flows.set()?.len(),
                    _ => return Err(step_error(step, state_name)),
                };
                state = State::Value(json!(count));
            }

            StepKind::Flows => {
                let upstream = match state {
                    State::Start => None,
                    State::Vertices(vertices) => Some(vertices),
                    other => return Err(step_error(step, other.name())),
                };
                let (plan, absorbed) = reduce_flow_steps(step.params.clone(), &steps[i + 1..]);
                state = State::Flows(exec_flows(ctx, time_slice, plan, upstream)?);
                consumed += absorbed;
            }

            StepKind::Hops | StepKind::Nodes | StepKind::CaptureNode => match &state {
                State::Flows(flows) => {
                    // An adjacent Has refines the node lookup.
                    let mut params = step.params.clone();
                    if let Some(next) = steps.get(i + 1) {
                        if next.kind == StepKind::Has {
                            params.extend(next.params.iter().cloned());
                            consumed += 1;
                        }
                    }
                    let nodes = join_flow_tids(ctx, flows.set()?, &params, |flow| {
                        match step.kind {
                            StepKind::Nodes => vec![
                                flow.node_tid.as_str(),
                                flow.a_node_tid.as_str(),
                                flow.b_node_tid.as_str(),
                            ],
                            _ => vec![flow.node_tid.as_str()],
                        }
                    })?;
                    state = State::Vertices(nodes);
                }
                _ => return Err(step_error(step, state_name)),
            },

            StepKind::Metrics => match &state {
                State::Flows(flows) => {
                    state = State::Metrics(exec_metrics(ctx, time_slice, flows)?);
                }
                _ => return Err(step_error(step, state_name)),
            },

            StepKind::Aggregates => match &state {
                State::Metrics(metrics) => {
                    state = State::Metrics(aggregate(metrics));
                }
                _ => return Err(step_error(step, state_name)),
            },

            StepKind::Sum => match &state {
                State::Flows(flows) => {
                    state = State::Value(sum_field(flows.set()?, &step.params)?);
                }
                _ => return Err(step_error(step, state_name)),
            },

            StepKind::PropertyValues => match &state {
                State::Flows(flows) => {
                    state = State::Value(property_values(flows.set()?, &step.params)?);
                }
                _ => return Err(step_error(step, state_name)),
            },

            StepKind::PropertyKeys => match &state {
                State::Flows(_) => {
                    state = State::Value(json!(Flow::field_paths()));
                }
                _ => return Err(step_error(step, state_name)),
            },
        }

        i += consumed;
    }

    match state {
        State::Start => Ok(TraversalValue::Vertices(Vec::new())),
        State::Vertices(vertices) => Ok(TraversalValue::Vertices(vertices)),
        State::Flows(mut flows) => Ok(TraversalValue::Flows(
            flows.set.take().unwrap_or_default(),
        )),
        State::Metrics(metrics) => Ok(TraversalValue::Metrics(metrics)),
        State::Value(value) => Ok(TraversalValue::Value(value)),
    }
}

fn step_error(step: &Step, state_name: &'static str) -> QueryError {
    QueryError::Execution(format!("{:?} after {}", step.kind, state_name))
}

fn step_range(step: &Step) -> Range {
    match step.kind {
        StepKind::Limit => Range::new(0, step.params[0].as_int().unwrap_or(0)),
        _ => Range::new(
            step.params[0].as_int().unwrap_or(0),
            step.params[1].as_int().unwrap_or(0),
        ),
    }
}

/// Absorb the contiguous chain of compatible steps following `Flows()`
/// into its search query. Returns the plan and how many steps were
/// consumed; the first non-absorbable step breaks the chain and runs in
/// memory.
fn reduce_flow_steps(has_params: Vec<StepParam>, rest: &[Step]) -> (FlowPlan, usize) {
    let mut plan = FlowPlan {
        has_params,
        sort_by: DEFAULT_SORT_BY.to_string(),
        ..FlowPlan::default()
    };
    let mut consumed = 0;

    for step in rest {
        match step.kind {
            StepKind::Has => {
                plan.has_params.extend(step.params.iter().cloned());
            }
            StepKind::Dedup => {
                plan.dedup = true;
                plan.dedup_by = step
                    .params
                    .first()
                    .and_then(StepParam::as_str)
                    .map(str::to_string);
            }
            StepKind::Sort => {
                plan.sort = true;
                let (order, key) = sort_params(&step.params);
                plan.sort_order = order;
                plan.sort_by = key;
            }
            StepKind::Range if plan.pagination.is_none() => {
                plan.pagination = Some(step_range(step));
            }
            StepKind::Limit if plan.pagination.is_none() => {
                plan.pagination = Some(step_range(step));
            }
            StepKind::Metrics => {
                // Flagged but not absorbed; the step itself still runs
                // and queries the metric index instead of flows.
                plan.metrics_next = true;
                break;
            }
            _ => break,
        }
        consumed += 1;
    }

    (plan, consumed)
}

fn exec_flows(
    ctx: &TraversalContext,
    time_slice: Option<TimeSlice>,
    plan: FlowPlan,
    upstream: Option<Vec<Node>>,
) -> QueryResult<FlowState> {
    let mut query = SearchQuery {
        filter: if plan.has_params.is_empty() {
            None
        } else {
            Some(params_to_filter(&plan.has_params)?)
        },
        // The store is asked for the full prefix; the visible window is
        // re-sliced in memory below.
        pagination: plan.pagination.map(|r| Range::new(0, r.to)),
        dedup: plan.dedup,
        dedup_by: plan.dedup_by.clone(),
        sort: plan.sort,
        sort_by: plan.sort.then(|| plan.sort_by.clone()),
        sort_order: plan.sort_order,
    };

    // Flows only exist on capture-eligible nodes.
    let nodes = upstream.map(|vertices| {
        vertices
            .into_iter()
            .filter(|n| {
                n.get_field_string("Type")
                    .map(|t| ctx.capture_types.is_capture_allowed(&t))
                    .unwrap_or(false)
            })
            .collect::<Vec<Node>>()
    });

    if let Some(nodes) = &nodes {
        if nodes.is_empty() {
            return Ok(FlowState {
                set: Some(FlowSet::default()),
                query,
            });
        }
    }

    let mut set = if let Some(ts) = time_slice {
        let storage = ctx
            .storage
            .as_ref()
            .ok_or(StorageError::NoStorageConfigured)?;

        // Widen the left edge by the expire interval: flows queried
        // live would still be in the tables that long after their last
        // packet, and the stored view must match.
        query.and_filter(Filter::active_in(
            Range::new(ts.start - ctx.flow_expire_ms, ts.last),
            "",
        ));

        if let Some(nodes) = &nodes {
            let tids: Vec<String> = nodes
                .iter()
                .filter_map(|n| n.tid().map(str::to_string))
                .collect();
            query.and_filter(node_filter(&tids));
        }

        if plan.metrics_next {
            // The metrics step queries the metric index directly; no
            // point loading full flows here.
            return Ok(FlowState { set: None, query });
        }

        storage.search_flows(&query)?
    } else {
        match &ctx.table_client {
            Some(client) => match &nodes {
                Some(nodes) => {
                    let map = {
                        let _g = ctx.graph.read();
                        mesh_graph::topology::build_host_node_tid_map(nodes)
                    };
                    client.lookup_flows_by_nodes(&map, &query)?
                }
                None => client.lookup_flows(&query)?,
            },
            None => FlowSet::default(),
        }
    };

    // Pagination is applied in memory so the visible window can be
    // recomputed cheaply over the store's sorted, deduped prefix.
    if let Some(r) = plan.pagination {
        set.slice(r.from, r.to);
    }

    Ok(FlowState {
        set: Some(set),
        query,
    })
}

fn exec_metrics(
    ctx: &TraversalContext,
    time_slice: Option<TimeSlice>,
    flows: &FlowState,
) -> QueryResult<HashMap<String, Vec<TimedMetric>>> {
    let Some(ts) = time_slice else {
        // Live mode: each flow contributes one sample, its last update
        // window when it has one, its whole lifetime otherwise.
        let mut metrics: HashMap<String, Vec<TimedMetric>> = HashMap::new();
        for flow in &flows.set()?.flows {
            metrics
                .entry(flow.uuid.clone())
                .or_default()
                .push(live_sample(flow));
        }
        return Ok(metrics);
    };

    let storage = ctx
        .storage
        .as_ref()
        .ok_or(StorageError::NoStorageConfigured)?;

    let mut query = flows.query.clone();
    if let Some(set) = &flows.set {
        // Flows were already retrieved (the chain was broken): restrict
        // the metric search to exactly those flows.
        let terms = set
            .flows
            .iter()
            .map(|f| Filter::term_string("UUID", &f.uuid))
            .collect::<Vec<_>>();
        if terms.is_empty() {
            return Ok(HashMap::new());
        }
        query.and_filter(Filter::or(terms));
    }

    let mut range = Range::new(0, ts.last);
    if ts.start != ts.last {
        range.from = ts.start;
    }
    query.sort = true;
    query.sort_by = Some(DEFAULT_SORT_BY.to_string());
    query.sort_order = SortOrder::Ascending;

    Ok(storage.search_metrics(&query, &Filter::included_in(range, ""))?)
}

fn live_sample(flow: &Flow) -> TimedMetric {
    if flow.last_update_start != 0 || flow.last_update_last != 0 {
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

/// Merge samples across flows by time bucket, summing counters.
fn aggregate(metrics: &HashMap<String, Vec<TimedMetric>>) -> HashMap<String, Vec<TimedMetric>> {
    let mut buckets: BTreeMap<(i64, i64), FlowMetric> = BTreeMap::new();
    for samples in metrics.values() {
        for sample in samples {
            let entry = buckets.entry((sample.start, sample.last)).or_default();
            *entry = entry.add(&sample.metric);
        }
    }
    let merged: Vec<TimedMetric> = buckets
        .into_iter()
        .map(|((start, last), metric)| TimedMetric {
            start,
            last,
            metric,
        })
        .collect();
    HashMap::from([("Aggregated".to_string(), merged)])
}

fn sum_field(set: &FlowSet, params: &[StepParam]) -> QueryResult<Value> {
    let key = params[0]
        .as_str()
        .ok_or_else(|| QueryError::InvalidArgument("Sum expects a string key".to_string()))?;
    let root = key.split('.').next().unwrap_or("");
    if root != "Metric" && root != "LastUpdateMetric" {
        return Err(QueryError::InvalidArgument(
            "Sum accepts only Metric and LastUpdateMetric fields".to_string(),
        ));
    }

    let mut total: i64 = 0;
    for flow in &set.flows {
        match flow.get_field_int64(key) {
            Ok(v) => total += v,
            Err(_) => return Err(QueryError::FieldNotFound),
        }
    }
    Ok(json!(total))
}

fn property_values(set: &FlowSet, params: &[StepParam]) -> QueryResult<Value> {
    let key = params[0].as_str().ok_or_else(|| {
        QueryError::InvalidArgument("PropertyValues expects a string key".to_string())
    })?;
    if set.is_empty() {
        return Err(QueryError::FieldNotFound);
    }

    // Missing fields are omitted: not every flow carries every layer.
    let mut values = Vec::new();
    for flow in &set.flows {
        if let Ok(v) = flow.get_field_int64(key) {
            values.push(json!(v));
        } else if let Ok(v) = flow.get_field_string(key) {
            values.push(json!(v));
        }
    }
    Ok(Value::Array(values))
}

fn hop(ctx: &TraversalContext, vertices: &[Node], filter: &Metadata, kind: StepKind) -> Vec<Node> {
    let g = ctx.graph.read();
    let empty = Metadata::new();
    let mut result = Vec::new();
    for n in vertices {
        if kind == StepKind::Out || kind == StepKind::Both {
            result.extend(g.lookup_children(n, filter, &empty));
        }
        if kind == StepKind::In || kind == StepKind::Both {
            result.extend(g.lookup_parents(n, filter, &empty));
        }
    }
    result
}

/// Resolve flow TIDs to graph nodes under the read lock. TIDs that are
/// empty or `*` are skipped; duplicates are kept for callers to Dedup.
fn join_flow_tids(
    ctx: &TraversalContext,
    set: &FlowSet,
    filter_params: &[StepParam],
    select: impl Fn(&Flow) -> Vec<&str>,
) -> QueryResult<Vec<Node>> {
    let base = metadata_from_params(filter_params)?;
    let g = ctx.graph.read();
    let mut nodes = Vec::new();
    for flow in &set.flows {
        for tid in select(flow) {
            if tid.is_empty() || tid == "*" {
                continue;
            }
            let mut filter = base.clone();
            filter.insert("TID".to_string(), Value::from(tid));
            if let Some(node) = g.lookup_first_node(&filter) {
                nodes.push(node);
            }
        }
    }
    Ok(nodes)
}

/// Key/value params to a metadata filter for graph lookups.
fn metadata_from_params(params: &[StepParam]) -> QueryResult<Metadata> {
    if params.len() % 2 != 0 {
        return Err(QueryError::InvalidArgument(
            "expected key/value pairs".to_string(),
        ));
    }
    let mut metadata = Metadata::new();
    for pair in params.chunks(2) {
        let key = pair[0]
            .as_str()
            .ok_or_else(|| QueryError::InvalidArgument("keys must be strings".to_string()))?;
        let value = match &pair[1] {
            StepParam::Str(s) => Value::from(s.as_str()),
            StepParam::Int(v) => Value::from(*v),
            StepParam::Bool(b) => Value::from(*b),
            StepParam::Order(_) => {
                return Err(QueryError::InvalidArgument(
                    "sort order is not a value".to_string(),
                ))
            }
        };
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

/// Key/value params to a flow filter. Layer keys expand to both
/// endpoints: `Has('Network', v)` matches `Network.A` or `Network.B`.
fn params_to_filter(params: &[StepParam]) -> QueryResult<Filter> {
    if params.is_empty() || params.len() % 2 != 0 {
        return Err(QueryError::InvalidArgument(
            "expected key/value pairs".to_string(),
        ));
    }
    let mut filters = Vec::new();
    for pair in params.chunks(2) {
        let key = pair[0]
            .as_str()
            .ok_or_else(|| QueryError::InvalidArgument("keys must be strings".to_string()))?;
        let filter = match &pair[1] {
            StepParam::Str(v)
                if matches!(
                    key.split('.').next(),
                    Some("Network") | Some("Link") | Some("Transport")
                ) && !key.contains('.') =>
            {
                Filter::or(vec![
                    Filter::term_string(&format!("{key}.A"), v),
                    Filter::term_string(&format!("{key}.B"), v),
                ])
            }
            StepParam::Str(v) => Filter::term_string(key, v),
            StepParam::Int(v) => Filter::term_int(key, *v),
            StepParam::Bool(b) => Filter::term_bool(key, *b),
            StepParam::Order(_) => {
                return Err(QueryError::InvalidArgument(
                    "sort order is not a value".to_string(),
                ))
            }
        };
        filters.push(filter);
    }
    Ok(Filter::and(filters))
}

fn sort_params(params: &[StepParam]) -> (SortOrder, String) {
    match params {
        [StepParam::Order(desc), StepParam::Str(key)] => (
            if *desc {
                SortOrder::Descending
            } else {
                SortOrder::Ascending
            },
            key.clone(),
        ),
        [StepParam::Str(key)] => (SortOrder::Ascending, key.clone()),
        _ => (SortOrder::Ascending, DEFAULT_SORT_BY.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_graph::metadata;

    fn context() -> TraversalContext {
        let graph = Arc::new(Graph::memory("test"));
        {
            let mut w = graph.write();
            let host = w
                .new_node(metadata! {"Type" => "host", "Name" => "host-1"})
                .unwrap();
            let veth1 = w
                .new_node(metadata! {"Type" => "veth", "Name" => "veth1", "TID" => "a"})
                .unwrap();
            let veth2 = w
                .new_node(metadata! {"Type" => "veth", "Name" => "veth2", "TID" => "b"})
                .unwrap();
            w.link(&host, &veth1, metadata! {"RelationType" => "ownership"});
            w.link(&host, &veth2, metadata! {"RelationType" => "ownership"});
        }
        TraversalContext {
            graph,
            table_client: None,
            storage: None,
            capture_types: Arc::new(CaptureTypeRegistry::default()),
            flow_expire_ms: 0,
        }
    }

    fn vertices(value: TraversalValue) -> Vec<Node> {
        match value {
            TraversalValue::Vertices(v) => v,
            other => panic!("expected vertices, got {other:?}"),
        }
    }

    #[test]
    fn v_returns_all_nodes() {
        let ctx = context();
        let nodes = vertices(execute(&ctx, "G.V()").unwrap());
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn has_filters_vertices() {
        let ctx = context();
        let nodes = vertices(execute(&ctx, "G.V().Has('Type', 'veth')").unwrap());
        assert_eq!(nodes.len(), 2);

        let nodes = vertices(execute(&ctx, "G.V().Has('Type', 'veth', 'Name', 'veth1')").unwrap());
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn out_follows_children() {
        let ctx = context();
        let nodes = vertices(execute(&ctx, "G.V().Has('Type', 'host').Out()").unwrap());
        assert_eq!(nodes.len(), 2);

        let nodes = vertices(
            execute(&ctx, "G.V().Has('Type', 'host').Out('Name', 'veth1')").unwrap(),
        );
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn in_follows_parents() {
        let ctx = context();
        let nodes = vertices(execute(&ctx, "G.V().Has('Name', 'veth1').In()").unwrap());
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].get_field_string("Type").unwrap(), "host");
    }

    #[test]
    fn count_is_a_value() {
        let ctx = context();
        match execute(&ctx, "G.V().Has('Type', 'veth').Count()").unwrap() {
            TraversalValue::Value(v) => assert_eq!(v, json!(2)),
            other => panic!("expected value, got {other:?}"),
        }
    }

    #[test]
    fn dedup_and_range_on_vertices() {
        let ctx = context();
        let nodes = vertices(execute(&ctx, "G.V().Dedup().Range(0, 2)").unwrap());
        assert_eq!(nodes.len(), 2);

        let nodes = vertices(execute(&ctx, "G.V().Limit(1)").unwrap());
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn incompatible_step_is_execution_error() {
        let ctx = context();
        assert!(matches!(
            execute(&ctx, "G.V().Aggregates()"),
            Err(QueryError::Execution(_))
        ));
        assert!(matches!(
            execute(&ctx, "G.V().Metrics()"),
            Err(QueryError::Execution(_))
        ));
    }

    #[test]
    fn time_slice_without_storage_errors() {
        let ctx = context();
        assert!(matches!(
            execute(&ctx, "G.Context(1000, 2000).V().Flows()"),
            Err(QueryError::Storage(StorageError::NoStorageConfigured))
        ));
    }

    #[test]
    fn flows_without_tables_or_slice_is_empty() {
        let ctx = context();
        match execute(&ctx, "G.V().Flows()").unwrap() {
            TraversalValue::Flows(set) => assert!(set.is_empty()),
            other => panic!("expected flows, got {other:?}"),
        }
    }

    #[test]
    fn layer_keys_expand_to_both_endpoints() {
        let filter = params_to_filter(&[
            StepParam::Str("Network".to_string()),
            StepParam::Str("10.0.0.1".to_string()),
        ])
        .unwrap();
        assert_eq!(
            filter,
            Filter::or(vec![
                Filter::term_string("Network.A", "10.0.0.1"),
                Filter::term_string("Network.B", "10.0.0.1"),
            ])
        );

        // Dotted keys are used verbatim.
        let filter = params_to_filter(&[
            StepParam::Str("Network.A".to_string()),
            StepParam::Str("10.0.0.1".to_string()),
        ])
        .unwrap();
        assert_eq!(filter, Filter::term_string("Network.A", "10.0.0.1"));
    }

    #[test]
    fn reduce_absorbs_adjacent_chain() {
        let steps = parse("G.V().Flows().Has('Transport', 'tcp').Sort().Limit(10)").unwrap();
        // Steps after Flows: Has, Sort, Limit.
        let (plan, consumed) = reduce_flow_steps(Vec::new(), &steps[2..]);
        assert_eq!(consumed, 3);
        assert_eq!(plan.has_params.len(), 2);
        assert!(plan.sort);
        assert_eq!(plan.sort_by, "Last");
        assert_eq!(plan.pagination, Some(Range::new(0, 10)));
        assert!(!plan.metrics_next);
    }

    #[test]
    fn reduce_flags_metrics_without_absorbing() {
        let steps = parse("G.V().Flows().Metrics()").unwrap();
        let (plan, consumed) = reduce_flow_steps(Vec::new(), &steps[2..]);
        assert!(plan.metrics_next);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn second_range_breaks_the_chain() {
        let steps =
            parse("G.V().Flows().Limit(10).Limit(5).Has('Network', '10.0.0.1')").unwrap();
        let (plan, consumed) = reduce_flow_steps(Vec::new(), &steps[2..]);
        // Only the first Limit is absorbed; the second and the Has run
        // in memory.
        assert_eq!(consumed, 1);
        assert_eq!(plan.pagination, Some(Range::new(0, 10)));
        assert!(plan.has_params.is_empty());
    }

    #[test]
    fn aggregate_sums_per_bucket() {
        let metric = |ab: i64| FlowMetric {
            ab_packets: ab,
            ..FlowMetric::default()
        };
        let metrics = HashMap::from([
            (
                "f1".to_string(),
                vec![
                    TimedMetric { start: 0, last: 10, metric: metric(1) },
                    TimedMetric { start: 10, last: 20, metric: metric(2) },
                ],
            ),
            (
                "f2".to_string(),
                vec![TimedMetric { start: 0, last: 10, metric: metric(5) }],
            ),
        ]);

        let merged = aggregate(&metrics);
        let samples = &merged["Aggregated"];
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].metric.ab_packets, 6);
        assert_eq!(samples[1].metric.ab_packets, 2);
    }
}
