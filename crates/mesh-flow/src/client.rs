//! Query and shipping clients for live flow tables.
//!
//! The table client answers traversal queries from in-memory tables;
//! the client pool ships captured flows towards the analyzer. Shipping
//! is best-effort: queues are bounded and overflow drops flows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mesh_core::SearchQuery;

use crate::flow::{Flow, FlowResult};
use crate::flowset::FlowSet;
use crate::table::TableAllocator;

/// Looks up live flows matching a query.
///
/// `host_node_tids` maps agent hostnames to the capture-point TIDs the
/// query resolved; only those hosts are asked.
pub trait TableClient: Send + Sync {
    fn lookup_flows(&self, query: &SearchQuery) -> FlowResult<FlowSet>;

    fn lookup_flows_by_nodes(
        &self,
        host_node_tids: &HashMap<String, Vec<String>>,
        query: &SearchQuery,
    ) -> FlowResult<FlowSet>;
}

/// Table client over this process's own allocator.
pub struct LocalTableClient {
    allocator: Arc<TableAllocator>,
}

impl LocalTableClient {
    pub fn new(allocator: Arc<TableAllocator>) -> Self {
        Self { allocator }
    }
}

impl TableClient for LocalTableClient {
    fn lookup_flows(&self, query: &SearchQuery) -> FlowResult<FlowSet> {
        let set = self.allocator.collect(query.filter.as_ref(), None);
        set.apply_query(query)
    }

    fn lookup_flows_by_nodes(
        &self,
        host_node_tids: &HashMap<String, Vec<String>>,
        query: &SearchQuery,
    ) -> FlowResult<FlowSet> {
        let mut set = FlowSet::default();
        for (host, tids) in host_node_tids {
            if host != self.allocator.host() {
                continue;
            }
            set.merge(self.allocator.collect(query.filter.as_ref(), Some(tids)));
        }
        set.apply_query(query)
    }
}

/// Ships batches of flows to one analyzer endpoint.
pub trait FlowSender: Send + Sync + 'static {
    fn send_flows(&self, flows: Vec<Flow>);
}

struct PoolSlot {
    tx: mpsc::Sender<Vec<Flow>>,
    handle: JoinHandle<()>,
}

/// Fan-out pool of flow senders with per-client bounded queues.
#[derive(Default)]
pub struct FlowClientPool {
    slots: Mutex<Vec<PoolSlot>>,
}

impl FlowClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sender with its own bounded queue.
    pub fn register(&self, sender: Arc<dyn FlowSender>, queue_size: usize) {
        let (tx, mut rx) = mpsc::channel::<Vec<Flow>>(queue_size.max(1));
        let handle = tokio::spawn(async move {
            while let Some(flows) = rx.recv().await {
                sender.send_flows(flows);
            }
            debug!("flow client drained");
        });
        self.lock().push(PoolSlot { tx, handle });
    }

    /// Enqueue a batch to every client; a full queue drops the batch for
    /// that client.
    pub fn send_flows(&self, flows: &[Flow]) {
        if flows.is_empty() {
            return;
        }
        for slot in self.lock().iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = slot.tx.try_send(flows.to_vec()) {
                warn!(count = flows.len(), "flow client queue full, dropping batch");
            }
        }
    }

    /// Close all queues and wait for the forwarding tasks to drain.
    pub async fn shutdown(&self) {
        let slots = std::mem::take(&mut *self.lock());
        for slot in slots {
            drop(slot.tx);
            let _ = slot.handle.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PoolSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
