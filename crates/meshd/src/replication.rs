//! Graph replication over the config store.
//!
//! Agents publish every node/edge mutation as JSON under
//! `/node/<host>/<id>` and `/edge/<host>/<id>`; the analyzer watches
//! both prefixes and mirrors them into its own graph. Replication is
//! eventually consistent per host subtree.
//!
//! The publisher is a graph event listener; it runs under the writer
//! lock and therefore only enqueues. A background task performs the
//! store writes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mesh_config::{ConfigStore, WatchAction};
use mesh_graph::{Edge, Graph, GraphEventListener, GraphView, ListenerId, Node};

enum Mutation {
    PutNode(Node),
    DelNode(Node),
    PutEdge(Edge),
    DelEdge(Edge),
}

fn node_key(n: &Node) -> String {
    format!("/node/{}/{}", n.host, n.id)
}

fn edge_key(e: &Edge) -> String {
    format!("/edge/{}/{}", e.host, e.id)
}

struct Publisher {
    tx: mpsc::UnboundedSender<Mutation>,
}

impl GraphEventListener for Publisher {
    fn on_node_added(&self, _g: &GraphView<'_>, n: &Node) {
        let _ = self.tx.send(Mutation::PutNode(n.clone()));
    }
    fn on_node_updated(&self, _g: &GraphView<'_>, n: &Node) {
        let _ = self.tx.send(Mutation::PutNode(n.clone()));
    }
    fn on_node_deleted(&self, _g: &GraphView<'_>, n: &Node) {
        let _ = self.tx.send(Mutation::DelNode(n.clone()));
    }
    fn on_edge_added(&self, _g: &GraphView<'_>, e: &Edge) {
        let _ = self.tx.send(Mutation::PutEdge(e.clone()));
    }
    fn on_edge_updated(&self, _g: &GraphView<'_>, e: &Edge) {
        let _ = self.tx.send(Mutation::PutEdge(e.clone()));
    }
    fn on_edge_deleted(&self, _g: &GraphView<'_>, e: &Edge) {
        let _ = self.tx.send(Mutation::DelEdge(e.clone()));
    }
}

/// Handle to the agent-side publisher.
pub struct GraphPublisher {
    listener_id: ListenerId,
    handle: JoinHandle<()>,
}

impl GraphPublisher {
    /// Mirror every graph mutation into the store.
    pub fn start(graph: &Arc<Graph>, store: Arc<dyn ConfigStore>) -> GraphPublisher {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener_id = graph.add_event_listener(Arc::new(Publisher { tx }));

        let handle = tokio::spawn(async move {
            while let Some(mutation) = rx.recv().await {
                let result = match &mutation {
                    Mutation::PutNode(n) => match serde_json::to_value(n) {
                        Ok(value) => store.set(&node_key(n), value),
                        Err(e) => {
                            warn!(error = %e, "node encode failed");
                            continue;
                        }
                    },
                    Mutation::DelNode(n) => store.delete(&node_key(n)),
                    Mutation::PutEdge(e) => match serde_json::to_value(e) {
                        Ok(value) => store.set(&edge_key(e), value),
                        Err(e) => {
                            warn!(error = %e, "edge encode failed");
                            continue;
                        }
                    },
                    Mutation::DelEdge(e) => store.delete(&edge_key(e)),
                };
                if let Err(e) = result {
                    warn!(error = %e, "graph publish failed");
                }
            }
            debug!("graph publisher drained");
        });

        GraphPublisher {
            listener_id,
            handle,
        }
    }

    pub async fn stop(self, graph: &Graph) {
        graph.remove_event_listener(self.listener_id);
        // The listener is gone; dropping it closed the only sender.
        let _ = self.handle.await;
    }
}

/// Analyzer-side mirror: apply watched node/edge entries to the graph.
pub fn spawn_graph_mirror(
    graph: Arc<Graph>,
    store: Arc<dyn ConfigStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let node_stream = store.watch("/node/");
        let edge_stream = store.watch("/edge/");
        let (mut node_stream, mut edge_stream) = match (node_stream, edge_stream) {
            (Ok(n), Ok(e)) => (n, e),
            _ => {
                warn!("graph mirror could not subscribe");
                return;
            }
        };

        // Baseline snapshot before live events.
        if let Ok(entries) = store.list("/node/") {
            let mut w = graph.write();
            for (key, value) in entries {
                match serde_json::from_value::<Node>(value) {
                    Ok(node) => {
                        w.add_node(node);
                    }
                    Err(e) => warn!(%key, error = %e, "skipping undecodable node"),
                }
            }
        }
        if let Ok(entries) = store.list("/edge/") {
            let mut w = graph.write();
            for (key, value) in entries {
                match serde_json::from_value::<Edge>(value) {
                    Ok(edge) => {
                        w.add_edge(edge);
                    }
                    Err(e) => warn!(%key, error = %e, "skipping undecodable edge"),
                }
            }
        }

        loop {
            tokio::select! {
                event = node_stream.next() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(error = %e, "node watch interrupted");
                            return;
                        }
                    };
                    let payload = match event.action {
                        WatchAction::Delete | WatchAction::Expire => event.prev_value,
                        _ => event.value,
                    };
                    let node: Node = match payload.and_then(|v| serde_json::from_value(v).ok()) {
                        Some(node) => node,
                        None => continue,
                    };
                    let mut w = graph.write();
                    match event.action {
                        WatchAction::Delete | WatchAction::Expire => {
                            w.del_node(&node.id);
                        }
                        WatchAction::Update => {
                            // Replace wholesale; per-key diffing happens
                            // on the agent side.
                            w.del_node(&node.id);
                            w.add_node(node);
                        }
                        _ => {
                            w.add_node(node);
                        }
                    }
                }
                event = edge_stream.next() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(error = %e, "edge watch interrupted");
                            return;
                        }
                    };
                    let payload = match event.action {
                        WatchAction::Delete | WatchAction::Expire => event.prev_value,
                        _ => event.value,
                    };
                    let edge: Edge = match payload.and_then(|v| serde_json::from_value(v).ok()) {
                        Some(edge) => edge,
                        None => continue,
                    };
                    let mut w = graph.write();
                    match event.action {
                        WatchAction::Delete | WatchAction::Expire => {
                            w.del_edge(&edge.id);
                        }
                        WatchAction::Update => {
                            w.del_edge(&edge.id);
                            w.add_edge(edge);
                        }
                        _ => {
                            w.add_edge(edge);
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_config::MemoryConfigStore;
    use mesh_graph::{metadata, GraphReadOps};
    use std::time::Duration;

    #[tokio::test]
    async fn publisher_mirrors_mutations_into_the_store() {
        let graph = Arc::new(Graph::memory("agent-1"));
        let store = Arc::new(MemoryConfigStore::new());
        let publisher = GraphPublisher::start(&graph, store.clone());

        let (node, edge) = {
            let mut w = graph.write();
            let a = w.new_node(metadata! {"Name" => "eth0"}).unwrap();
            let b = w.new_node(metadata! {"Name" => "br0"}).unwrap();
            let e = w.new_edge(&b, &a, metadata! {"RelationType" => "ownership"}).unwrap();
            (a, e)
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = store.get(&node_key(&node)).unwrap();
        let decoded: Node = serde_json::from_value(stored).unwrap();
        assert_eq!(decoded, node);
        assert!(store.get(&edge_key(&edge)).is_ok());

        graph.write().del_node(&node.id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(&node_key(&node)).is_err());
        // The incident edge went with it.
        assert!(store.get(&edge_key(&edge)).is_err());

        publisher.stop(&graph).await;
    }

    #[tokio::test]
    async fn mirror_applies_remote_mutations() {
        let agent_graph = Arc::new(Graph::memory("agent-1"));
        let analyzer_graph = Arc::new(Graph::memory("analyzer"));
        let store = Arc::new(MemoryConfigStore::new());

        // Pre-existing topology lands via the baseline pass.
        let publisher = GraphPublisher::start(&agent_graph, store.clone());
        let existing = agent_graph
            .write()
            .new_node(metadata! {"Name" => "eth0", "TID" => "t1"})
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mirror = spawn_graph_mirror(analyzer_graph.clone(), store.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(analyzer_graph.read().get_node(&existing.id).is_some());

        // Live mutation flows through.
        let added = agent_graph
            .write()
            .new_node(metadata! {"Name" => "eth1"})
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(analyzer_graph.read().get_node(&added.id).is_some());

        agent_graph.write().del_node(&added.id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(analyzer_graph.read().get_node(&added.id).is_none());

        mirror.abort();
        publisher.stop(&agent_graph).await;
    }
}
