//! Probe bundle: capture type to probe implementation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use mesh_flow::Table;
use mesh_graph::Node;

use crate::{Capture, CaptureResult};

/// A packet-sampling mechanism (afpacket, sFlow, pcap socket, ...).
///
/// Implementations are external; the control plane only drives them.
/// `register_probe` attaches sampling on one node, feeding the given
/// flow table; `unregister_probe` detaches it.
pub trait FlowProbeHandler: Send + Sync {
    fn start(&self);

    fn stop(&self);

    fn register_probe(
        &self,
        node: &Node,
        capture: &Capture,
        table: Arc<Table>,
    ) -> CaptureResult<()>;

    fn unregister_probe(&self, node: &Node) -> CaptureResult<()>;
}

/// Probe instances routed by capture type, built once from
/// configuration.
#[derive(Default)]
pub struct ProbeBundle {
    probes: HashMap<String, Arc<dyn FlowProbeHandler>>,
}

impl ProbeBundle {
    pub fn new(probes: HashMap<String, Arc<dyn FlowProbeHandler>>) -> Self {
        info!(capture_types = ?probes.keys().collect::<Vec<_>>(), "probe bundle built");
        Self { probes }
    }

    /// The probe handling a capture type, if one is configured.
    pub fn get(&self, capture_type: &str) -> Option<Arc<dyn FlowProbeHandler>> {
        self.probes.get(capture_type).cloned()
    }

    pub fn start(&self) {
        for probe in self.probes.values() {
            probe.start();
        }
    }

    pub fn stop(&self) {
        for probe in self.probes.values() {
            probe.stop();
        }
    }
}
