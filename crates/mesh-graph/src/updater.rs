//! Node updater — bounded queue feeding per-node enhancement work.
//!
//! Topology probes learn about nodes from graph events but must not do
//! blocking work on the dispatch thread. They push node IDs here; a
//! background task hands each ID to the probe's enhancer with a bounded
//! fan-out. The queue is bounded: overflow drops the oldest entry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::element::Identifier;
use crate::graph::{Graph, GraphReadOps};

/// Per-node enhancement hook, called off the graph dispatch thread.
///
/// Implementations take their own graph locks; they are free to block
/// and to mutate.
pub trait NodeEnhancer: Send + Sync + 'static {
    fn enhance(&self, graph: &Graph, id: &Identifier);
}

struct UpdateQueue {
    entries: Mutex<VecDeque<Identifier>>,
    notify: Notify,
    capacity: usize,
}

impl UpdateQueue {
    fn push(&self, id: Identifier) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            let dropped = entries.pop_front();
            warn!(?dropped, "node updater queue full, dropping oldest update");
        }
        entries.push_back(id);
        drop(entries);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Identifier> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Background worker draining the queue into an enhancer.
pub struct NodeUpdater {
    queue: Arc<UpdateQueue>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl NodeUpdater {
    /// Start the worker. `capacity` bounds the queue, `fan_out` the
    /// number of concurrently running enhancements.
    pub fn start(
        graph: Arc<Graph>,
        enhancer: Arc<dyn NodeEnhancer>,
        capacity: usize,
        fan_out: usize,
    ) -> Self {
        let queue = Arc::new(UpdateQueue {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker_queue = queue.clone();
        let handle = tokio::spawn(async move {
            run_updater(graph, enhancer, worker_queue, fan_out.max(1), shutdown_rx).await;
        });

        Self {
            queue,
            shutdown_tx,
            handle,
        }
    }

    /// Enqueue a node for enhancement. Never blocks; safe to call from a
    /// graph event listener.
    pub fn push(&self, id: Identifier) {
        self.queue.push(id);
    }

    /// Stop the worker: drain the queue, wait for in-flight
    /// enhancements, then join.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn run_updater(
    graph: Arc<Graph>,
    enhancer: Arc<dyn NodeEnhancer>,
    queue: Arc<UpdateQueue>,
    fan_out: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(fan_out));
    let mut in_flight = JoinSet::new();

    debug!(fan_out, "node updater started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = queue.notify.notified() => {
                drain(&graph, &enhancer, &queue, &semaphore, &mut in_flight).await;
            }
            // Reap finished enhancements so the set stays small.
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    // Drain whatever is still queued, then wait for the last in-flight
    // update to complete.
    drain(&graph, &enhancer, &queue, &semaphore, &mut in_flight).await;
    while in_flight.join_next().await.is_some() {}

    debug!("node updater stopped");
}

async fn drain(
    graph: &Arc<Graph>,
    enhancer: &Arc<dyn NodeEnhancer>,
    queue: &Arc<UpdateQueue>,
    semaphore: &Arc<Semaphore>,
    in_flight: &mut JoinSet<()>,
) {
    while let Some(id) = queue.pop() {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let graph = graph.clone();
        let enhancer = enhancer.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            enhancer.enhance(&graph, &id);
        });
    }
}
