//! Capture manager — reconciles probe registrations.
//!
//! The manager listens to the capture watcher and to the graph event
//! bus. On any change it re-resolves each capture's query against the
//! graph and diffs the result against what is registered. The capture
//! index mutex is never held across probe calls: the diff is computed
//! under the lock, then applied outside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mesh_config::{ConfigResult, ConfigStore, ResourceHandler, StoppableWatcher, WatchAction};
use mesh_core::CaptureTypeRegistry;
use mesh_flow::TableAllocator;
use mesh_graph::{
    Graph, GraphEventListener, GraphView, Identifier, ListenerId, Node,
};
use mesh_query::{execute, TraversalContext, TraversalValue};

use crate::capture::Capture;
use crate::probe::ProbeBundle;

enum Event {
    CaptureSet(Capture),
    CaptureDeleted(String),
    GraphChanged,
}

struct CaptureEntry {
    capture: Capture,
    /// Nodes a probe is currently registered on.
    registered: HashMap<Identifier, Node>,
}

struct ManagerInner {
    graph: Arc<Graph>,
    bundle: Arc<ProbeBundle>,
    allocator: Arc<TableAllocator>,
    capture_types: Arc<CaptureTypeRegistry>,
    captures: Mutex<HashMap<String, CaptureEntry>>,
}

/// Forwards graph mutations into the manager loop. Runs under the
/// graph writer lock, so it only enqueues.
struct GraphForwarder {
    tx: mpsc::UnboundedSender<Event>,
}

impl GraphEventListener for GraphForwarder {
    fn on_node_added(&self, _g: &GraphView<'_>, _n: &Node) {
        let _ = self.tx.send(Event::GraphChanged);
    }
    fn on_node_updated(&self, _g: &GraphView<'_>, _n: &Node) {
        let _ = self.tx.send(Event::GraphChanged);
    }
    fn on_node_deleted(&self, _g: &GraphView<'_>, _n: &Node) {
        let _ = self.tx.send(Event::GraphChanged);
    }
}

/// The running capture manager.
pub struct CaptureManager {
    inner: Arc<ManagerInner>,
    watcher: Option<StoppableWatcher>,
    listener_id: ListenerId,
    loop_handle: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<Event>,
}

impl CaptureManager {
    /// Wire the manager to the store and the graph and start its loop.
    ///
    /// The watcher's init replay lands in the loop's queue, so the
    /// initial reconciliation happens as soon as the loop runs.
    pub fn start(
        graph: Arc<Graph>,
        bundle: Arc<ProbeBundle>,
        allocator: Arc<TableAllocator>,
        capture_types: Arc<CaptureTypeRegistry>,
        store: Arc<dyn ConfigStore>,
    ) -> ConfigResult<CaptureManager> {
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ManagerInner {
            graph: graph.clone(),
            bundle,
            allocator,
            capture_types,
            captures: Mutex::new(HashMap::new()),
        });

        let handler = ResourceHandler::<Capture>::new(store);
        let watch_tx = tx.clone();
        let watcher = handler.async_watch(move |action, id, capture| {
            let event = match action {
                WatchAction::Init | WatchAction::Create | WatchAction::Update => {
                    Event::CaptureSet(capture)
                }
                WatchAction::Delete | WatchAction::Expire => Event::CaptureDeleted(id),
            };
            let _ = watch_tx.send(event);
        })?;

        let listener_id = graph.add_event_listener(Arc::new(GraphForwarder { tx: tx.clone() }));

        let loop_inner = inner.clone();
        let loop_handle = tokio::spawn(async move {
            run_manager(loop_inner, rx).await;
        });

        info!("capture manager started");
        Ok(CaptureManager {
            inner,
            watcher: Some(watcher),
            listener_id,
            loop_handle: Some(loop_handle),
            tx,
        })
    }

    /// Capture IDs currently under management.
    pub fn capture_ids(&self) -> Vec<String> {
        let captures = lock(&self.inner.captures);
        captures.keys().cloned().collect()
    }

    /// Nodes a capture currently has probes registered on.
    pub fn registered_nodes(&self, capture_id: &str) -> Vec<Identifier> {
        let captures = lock(&self.inner.captures);
        captures
            .get(capture_id)
            .map(|entry| entry.registered.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ask the loop for a reconciliation pass.
    pub fn trigger_reconcile(&self) {
        let _ = self.tx.send(Event::GraphChanged);
    }

    /// Stop watching, unregister every probe, and join the loop.
    pub async fn stop(mut self) {
        self.inner.graph.remove_event_listener(self.listener_id);
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }

        // Closing the event channel ends the loop.
        let handle = self.loop_handle.take();
        drop(self.tx);
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let ids: Vec<String> = {
            let captures = lock(&self.inner.captures);
            captures.keys().cloned().collect()
        };
        for id in ids {
            remove_capture(&self.inner, &id);
        }
        info!("capture manager stopped");
    }
}

fn lock(
    captures: &Mutex<HashMap<String, CaptureEntry>>,
) -> std::sync::MutexGuard<'_, HashMap<String, CaptureEntry>> {
    captures.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_manager(inner: Arc<ManagerInner>, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        match event {
            Event::CaptureSet(capture) => {
                upsert_capture(&inner, capture);
                reconcile(&inner);
            }
            Event::CaptureDeleted(id) => {
                remove_capture(&inner, &id);
            }
            Event::GraphChanged => reconcile(&inner),
        }
    }
    debug!("capture manager loop exited");
}

fn upsert_capture(inner: &ManagerInner, capture: Capture) {
    let mut captures = lock(&inner.captures);
    let id = capture.uuid.clone();
    captures
        .entry(id)
        .and_modify(|entry| entry.capture = capture.clone())
        .or_insert_with(|| CaptureEntry {
            capture,
            registered: HashMap::new(),
        });
}

fn remove_capture(inner: &ManagerInner, id: &str) {
    let entry = lock(&inner.captures).remove(id);
    if let Some(entry) = entry {
        let nodes: Vec<Node> = entry.registered.into_values().collect();
        if !nodes.is_empty() {
            apply_diff(inner, &entry.capture, Vec::new(), nodes);
        }
        debug!(capture = %id, "capture removed");
    }
}

/// Resolve a capture's query to the capture-eligible nodes it selects.
fn resolve(inner: &ManagerInner, capture: &Capture) -> Vec<Node> {
    let ctx = TraversalContext {
        graph: inner.graph.clone(),
        table_client: None,
        storage: None,
        capture_types: inner.capture_types.clone(),
        flow_expire_ms: 0,
    };
    let nodes = match execute(&ctx, &capture.gremlin_query) {
        Ok(TraversalValue::Vertices(nodes)) => nodes,
        Ok(other) => {
            warn!(capture = %capture.uuid, ?other, "capture query did not select nodes");
            return Vec::new();
        }
        Err(e) => {
            warn!(capture = %capture.uuid, error = %e, "capture query failed");
            return Vec::new();
        }
    };
    nodes
        .into_iter()
        .filter(|n| {
            n.metadata
                .get("Type")
                .and_then(serde_json::Value::as_str)
                .map(|t| inner.capture_types.is_capture_allowed(t))
                .unwrap_or(false)
        })
        .collect()
}

/// One reconciliation pass over every capture. Diffs are computed with
/// the index locked and applied after it is released.
fn reconcile(inner: &ManagerInner) {
    struct Pending {
        capture: Capture,
        register: Vec<Node>,
        unregister: Vec<Node>,
    }

    let mut pending = Vec::new();
    {
        let mut captures = lock(&inner.captures);
        for entry in captures.values_mut() {
            let desired = resolve(inner, &entry.capture);
            let desired_map: HashMap<Identifier, Node> = desired
                .into_iter()
                .map(|n| (n.id.clone(), n))
                .collect();

            let register: Vec<Node> = desired_map
                .values()
                .filter(|n| !entry.registered.contains_key(&n.id))
                .cloned()
                .collect();
            let unregister: Vec<Node> = entry
                .registered
                .values()
                .filter(|n| !desired_map.contains_key(&n.id))
                .cloned()
                .collect();

            entry.registered = desired_map;
            if !register.is_empty() || !unregister.is_empty() {
                pending.push(Pending {
                    capture: entry.capture.clone(),
                    register,
                    unregister,
                });
            }
        }
    }

    for p in pending {
        apply_diff(inner, &p.capture, p.register, p.unregister);
    }
}

/// Apply a registration diff through the probe bundle, outside any
/// manager lock.
fn apply_diff(inner: &ManagerInner, capture: &Capture, register: Vec<Node>, unregister: Vec<Node>) {
    let handler = match inner.bundle.get(&capture.capture_type) {
        Some(handler) => handler,
        None => {
            warn!(
                capture = %capture.uuid,
                capture_type = %capture.capture_type,
                "no probe for capture type"
            );
            return;
        }
    };

    for node in unregister {
        if let Err(e) = handler.unregister_probe(&node) {
            warn!(node = %node.id, error = %e, "unregister probe failed");
        }
        if let Some(tid) = node.tid() {
            inner.allocator.release(tid);
        }
        debug!(capture = %capture.uuid, node = %node.id, "probe unregistered");
    }

    for node in register {
        let tid = match node.tid() {
            Some(tid) => tid.to_string(),
            None => {
                warn!(node = %node.id, "node has no TID, skipping registration");
                continue;
            }
        };
        let table = inner.allocator.alloc(&tid);
        if let Err(e) = handler.register_probe(&node, capture, table) {
            warn!(node = %node.id, error = %e, "register probe failed");
            continue;
        }
        debug!(capture = %capture.uuid, node = %node.id, "probe registered");
    }
}
