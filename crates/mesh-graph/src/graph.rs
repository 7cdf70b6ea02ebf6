//! The graph engine: locking, events, traversals, transactions.
//!
//! One reader-writer lock protects the whole graph. Mutators hold the
//! writer lock for their entire duration, including event dispatch, so
//! every listener observes mutations in a total order. Listeners receive
//! a read-only `GraphView` of the locked state; a listener that needs to
//! mutate must enqueue the work to another task.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::backend::{GraphBackend, MemoryBackend};
use crate::element::{Edge, GraphElementRef, Identifier, Metadata, Node};
use crate::topology::{LAYER2, RELATION_TYPE};

/// Result type alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors raised by graph mutations.
///
/// Most mutation failures are silent booleans: the graph represents
/// observed truth and contradictory observations lose. Errors are kept
/// for caller mistakes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("metadata key {0:?} is reserved")]
    ReservedKey(String),
}

/// Receives graph mutation events, synchronously, under the writer lock.
///
/// Callbacks run in listener-registration order and may read the graph
/// through the provided view. They must not attempt to mutate it on the
/// dispatch thread.
pub trait GraphEventListener: Send + Sync {
    fn on_node_added(&self, _g: &GraphView<'_>, _n: &Node) {}
    fn on_node_updated(&self, _g: &GraphView<'_>, _n: &Node) {}
    fn on_node_deleted(&self, _g: &GraphView<'_>, _n: &Node) {}
    fn on_edge_added(&self, _g: &GraphView<'_>, _e: &Edge) {}
    fn on_edge_updated(&self, _g: &GraphView<'_>, _e: &Edge) {}
    fn on_edge_deleted(&self, _g: &GraphView<'_>, _e: &Edge) {}
}

/// Handle for unregistering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    listener: Arc<dyn GraphEventListener>,
}

struct GraphInner {
    backend: Box<dyn GraphBackend>,
    listeners: Vec<ListenerEntry>,
    next_listener_id: u64,
}

/// The topology graph.
pub struct Graph {
    host: String,
    inner: RwLock<GraphInner>,
}

/// Read-side operations shared by every locked view of the graph.
pub trait GraphReadOps {
    fn backend(&self) -> &dyn GraphBackend;

    fn get_node(&self, id: &Identifier) -> Option<Node> {
        self.backend().get_node(id)
    }

    fn get_edge(&self, id: &Identifier) -> Option<Edge> {
        self.backend().get_edge(id)
    }

    fn get_nodes(&self) -> Vec<Node> {
        self.backend().get_nodes()
    }

    fn get_edges(&self) -> Vec<Edge> {
        self.backend().get_edges()
    }

    fn get_node_edges(&self, n: &Node) -> Vec<Edge> {
        self.backend().get_node_edges(&n.id)
    }

    /// Linear scan; a node matches when every filter key is present in
    /// its metadata with an equal value.
    fn lookup_nodes(&self, filter: &Metadata) -> Vec<Node> {
        self.backend()
            .get_nodes()
            .into_iter()
            .filter(|n| n.matches(filter))
            .collect()
    }

    fn lookup_first_node(&self, filter: &Metadata) -> Option<Node> {
        self.backend()
            .get_nodes()
            .into_iter()
            .find(|n| n.matches(filter))
    }

    /// Nodes that carry the given metadata key, whatever the value.
    fn lookup_nodes_from_key(&self, key: &str) -> Vec<Node> {
        self.backend()
            .get_nodes()
            .into_iter()
            .filter(|n| n.metadata.contains_key(key))
            .collect()
    }

    /// One hop along outgoing edges, applying both edge and child filters.
    fn lookup_children(&self, n: &Node, filter: &Metadata, edge_filter: &Metadata) -> Vec<Node> {
        let mut children = Vec::new();
        for e in self.backend().get_node_edges(&n.id) {
            if !e.matches(edge_filter) {
                continue;
            }
            let (parent, child) = match self.resolve_edge(&e) {
                Some(nodes) => nodes,
                None => continue,
            };
            if parent.id == n.id && child.matches(filter) {
                children.push(child);
            }
        }
        children
    }

    /// One hop along incoming edges, applying both edge and parent filters.
    fn lookup_parents(&self, n: &Node, filter: &Metadata, edge_filter: &Metadata) -> Vec<Node> {
        let mut parents = Vec::new();
        for e in self.backend().get_node_edges(&n.id) {
            if !e.matches(edge_filter) {
                continue;
            }
            let (parent, child) = match self.resolve_edge(&e) {
                Some(nodes) => nodes,
                None => continue,
            };
            if child.id == n.id && parent.matches(filter) {
                parents.push(parent);
            }
        }
        parents
    }

    /// DFS towards parents; the first path whose terminal matches the
    /// filter is returned ordered `n .. match` with true. When no parent
    /// matches, the nodes visited are returned with false.
    fn get_ancestors_to(&self, n: &Node, filter: &Metadata) -> (Vec<Node>, bool) {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let found = self.ancestors_dfs(n, filter, &mut path, &mut visited);
        (path, found)
    }

    #[doc(hidden)]
    fn ancestors_dfs(
        &self,
        n: &Node,
        filter: &Metadata,
        path: &mut Vec<Node>,
        visited: &mut HashSet<Identifier>,
    ) -> bool {
        if !visited.insert(n.id.clone()) {
            return false;
        }
        path.push(n.clone());

        let edges = self.backend().get_node_edges(&n.id);

        for e in &edges {
            let (parent, child) = match self.resolve_edge(e) {
                Some(nodes) => nodes,
                None => continue,
            };
            if child.id == n.id && parent.matches(filter) {
                path.push(parent);
                return true;
            }
        }

        for e in &edges {
            let (parent, child) = match self.resolve_edge(e) {
                Some(nodes) => nodes,
                None => continue,
            };
            if child.id == n.id
                && !visited.contains(&parent.id)
                && self.ancestors_dfs(&parent, filter, path, visited)
            {
                return true;
            }
        }

        false
    }

    fn are_linked(&self, a: &Node, b: &Node) -> bool {
        self.backend().get_node_edges(&a.id).iter().any(|e| {
            (e.parent == a.id && e.child == b.id) || (e.parent == b.id && e.child == a.id)
        })
    }

    /// True iff some edge between the two nodes carries
    /// `RelationType = layer2` and matches `extra`.
    fn have_layer2_link(&self, a: &Node, b: &Node, extra: &Metadata) -> bool {
        self.backend().get_node_edges(&a.id).iter().any(|e| {
            let between = (e.parent == a.id && e.child == b.id)
                || (e.parent == b.id && e.child == a.id);
            between
                && e.metadata.get(RELATION_TYPE).and_then(Value::as_str) == Some(LAYER2)
                && e.matches(extra)
        })
    }

    /// Resolve both endpoints, skipping dangling edges.
    #[doc(hidden)]
    fn resolve_edge(&self, e: &Edge) -> Option<(Node, Node)> {
        match self.backend().get_edge_nodes(e) {
            (Some(parent), Some(child)) => Some((parent, child)),
            _ => {
                debug!(edge = %e.id, "skipping dangling edge");
                None
            }
        }
    }
}

/// Read-only view handed to event listeners, valid for the dispatch.
pub struct GraphView<'a> {
    backend: &'a dyn GraphBackend,
}

impl GraphReadOps for GraphView<'_> {
    fn backend(&self) -> &dyn GraphBackend {
        self.backend
    }
}

/// Shared-lock view of the graph.
pub struct GraphReadGuard<'a> {
    inner: RwLockReadGuard<'a, GraphInner>,
}

impl GraphReadOps for GraphReadGuard<'_> {
    fn backend(&self) -> &dyn GraphBackend {
        self.inner.backend.as_ref()
    }
}

/// Exclusive-lock view of the graph; the only way to mutate it.
pub struct GraphWriteGuard<'a> {
    host: &'a str,
    inner: RwLockWriteGuard<'a, GraphInner>,
}

impl GraphReadOps for GraphWriteGuard<'_> {
    fn backend(&self) -> &dyn GraphBackend {
        self.inner.backend.as_ref()
    }
}

impl Graph {
    pub fn new(host: impl Into<String>, backend: Box<dyn GraphBackend>) -> Self {
        Self {
            host: host.into(),
            inner: RwLock::new(GraphInner {
                backend,
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
        }
    }

    /// A graph over the in-memory backend.
    pub fn memory(host: impl Into<String>) -> Self {
        Self::new(host, Box::new(MemoryBackend::new()))
    }

    /// The process-wide host identity embedded in created elements.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn read(&self) -> GraphReadGuard<'_> {
        GraphReadGuard {
            inner: self.inner.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn write(&self) -> GraphWriteGuard<'_> {
        GraphWriteGuard {
            host: &self.host,
            inner: self.inner.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn add_event_listener(&self, listener: Arc<dyn GraphEventListener>) -> ListenerId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push(ListenerEntry { id, listener });
        id
    }

    pub fn remove_event_listener(&self, id: ListenerId) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.listeners.retain(|entry| entry.id != id);
    }

    /// Begin buffering metadata updates against an element.
    ///
    /// No lock is held until `commit`; do not call with a guard live.
    pub fn start_metadata_transaction(&self, element: GraphElementRef) -> MetadataTransaction<'_> {
        MetadataTransaction {
            graph: self,
            element,
            updates: Vec::new(),
        }
    }
}

impl Serialize for Graph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let g = self.read();
        let mut s = serializer.serialize_struct("Graph", 2)?;
        s.serialize_field("Nodes", &g.get_nodes())?;
        s.serialize_field("Edges", &g.get_edges())?;
        s.end()
    }
}

impl GraphWriteGuard<'_> {
    /// Add a node. Duplicate IDs are a no-op returning false, no event.
    pub fn add_node(&mut self, n: Node) -> bool {
        if !self.inner.backend.add_node(&n) {
            return false;
        }
        self.each_listener(|l, view| l.on_node_added(view, &n));
        true
    }

    /// Create and add a node with a fresh ID and this graph's host.
    pub fn new_node(&mut self, metadata: Metadata) -> Option<Node> {
        let n = Node::new(Identifier::random(), self.host, metadata);
        if self.add_node(n.clone()) {
            Some(n)
        } else {
            None
        }
    }

    /// Delete a node and all incident edges. Edge deletion events are
    /// dispatched before the node deletion event.
    pub fn del_node(&mut self, id: &Identifier) -> bool {
        let node = match self.inner.backend.get_node(id) {
            Some(n) => n,
            None => return false,
        };
        for e in self.inner.backend.get_node_edges(id) {
            self.del_edge(&e.id);
        }
        if !self.inner.backend.del_node(id) {
            return false;
        }
        self.each_listener(|l, view| l.on_node_deleted(view, &node));
        true
    }

    pub fn add_edge(&mut self, e: Edge) -> bool {
        if !self.inner.backend.add_edge(&e) {
            return false;
        }
        self.each_listener(|l, view| l.on_edge_added(view, &e));
        true
    }

    /// Create and add an edge with a fresh ID and this graph's host.
    pub fn new_edge(&mut self, parent: &Node, child: &Node, metadata: Metadata) -> Option<Edge> {
        let e = Edge::new(
            Identifier::random(),
            self.host,
            parent.id.clone(),
            child.id.clone(),
            metadata,
        );
        if self.add_edge(e.clone()) {
            Some(e)
        } else {
            None
        }
    }

    pub fn del_edge(&mut self, id: &Identifier) -> bool {
        let edge = match self.inner.backend.get_edge(id) {
            Some(e) => e,
            None => return false,
        };
        if !self.inner.backend.del_edge(id) {
            return false;
        }
        self.each_listener(|l, view| l.on_edge_deleted(view, &edge));
        true
    }

    /// Set a single metadata key. Emits an update event and returns true
    /// when the stored value actually changed.
    pub fn set_metadata(
        &mut self,
        element: &GraphElementRef,
        key: &str,
        value: Value,
    ) -> GraphResult<bool> {
        if key.starts_with('_') {
            return Err(GraphError::ReservedKey(key.to_string()));
        }
        if !self.inner.backend.set_metadata(element, key, value) {
            return Ok(false);
        }
        self.notify_updated(element);
        Ok(true)
    }

    /// Link two nodes with a plain edge.
    pub fn link(&mut self, parent: &Node, child: &Node, metadata: Metadata) -> Option<Edge> {
        self.new_edge(parent, child, metadata)
    }

    /// Delete every edge between two nodes.
    pub fn unlink(&mut self, a: &Node, b: &Node) {
        for e in self.inner.backend.get_node_edges(&a.id) {
            if (e.parent == a.id && e.child == b.id) || (e.parent == b.id && e.child == a.id) {
                self.del_edge(&e.id);
            }
        }
    }

    /// Idempotent creation of a `RelationType = layer2` edge carrying
    /// `extra`. Returns the edge when one was created.
    pub fn add_layer2_link(&mut self, a: &Node, b: &Node, extra: Metadata) -> Option<Edge> {
        if self.have_layer2_link(a, b, &extra) {
            return None;
        }
        let mut metadata = extra;
        metadata.insert(RELATION_TYPE.to_string(), Value::from(LAYER2));
        self.new_edge(a, b, metadata)
    }

    /// Delete all descendants of a node along outgoing edges.
    pub fn del_sub_graph(&mut self, n: &Node) {
        let mut visited = HashSet::new();
        self.del_sub_graph_inner(n, &mut visited);
    }

    fn del_sub_graph_inner(&mut self, n: &Node, visited: &mut HashSet<Identifier>) {
        if !visited.insert(n.id.clone()) {
            return;
        }
        for e in self.inner.backend.get_node_edges(&n.id) {
            if e.parent != n.id {
                continue;
            }
            if let Some(child) = self.inner.backend.get_node(&e.child) {
                self.del_sub_graph_inner(&child, visited);
                self.del_node(&child.id);
            }
        }
    }

    /// Apply buffered updates without dispatching; reports whether any
    /// stored value changed.
    fn apply_metadata_updates(
        &mut self,
        element: &GraphElementRef,
        updates: Vec<(String, Value)>,
    ) -> bool {
        let mut changed = false;
        for (key, value) in updates {
            if self.inner.backend.set_metadata(element, &key, value) {
                changed = true;
            }
        }
        changed
    }

    fn notify_updated(&self, element: &GraphElementRef) {
        match element {
            GraphElementRef::Node(id) => {
                if let Some(n) = self.inner.backend.get_node(id) {
                    self.each_listener(|l, view| l.on_node_updated(view, &n));
                }
            }
            GraphElementRef::Edge(id) => {
                if let Some(e) = self.inner.backend.get_edge(id) {
                    self.each_listener(|l, view| l.on_edge_updated(view, &e));
                }
            }
        }
    }

    fn each_listener(&self, f: impl Fn(&dyn GraphEventListener, &GraphView<'_>)) {
        let inner: &GraphInner = &self.inner;
        let view = GraphView {
            backend: inner.backend.as_ref(),
        };
        for entry in &inner.listeners {
            f(entry.listener.as_ref(), &view);
        }
    }
}

/// Buffered metadata updates applied atomically on commit.
///
/// Observers see either the pre-state or the post-state; exactly one
/// update event is emitted when any key changed, none otherwise.
pub struct MetadataTransaction<'a> {
    graph: &'a Graph,
    element: GraphElementRef,
    updates: Vec<(String, Value)>,
}

impl MetadataTransaction<'_> {
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.updates.push((key.into(), value.into()));
    }

    pub fn commit(self) -> GraphResult<()> {
        for (key, _) in &self.updates {
            if key.starts_with('_') {
                return Err(GraphError::ReservedKey(key.clone()));
            }
        }

        let mut w = self.graph.write();
        if w.apply_metadata_updates(&self.element, self.updates) {
            w.notify_updated(&self.element);
        }
        Ok(())
    }
}
