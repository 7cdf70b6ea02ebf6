//! Live flow tables on the agent.
//!
//! Each registered capture point gets a table; probes ingest packets
//! into it and the query side reads it through the table client. Flows
//! expire after a configurable idle interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use mesh_core::Filter;

use crate::flow::{Flow, FlowMetric};
use crate::flowset::FlowSet;

/// Flows captured at a single node, keyed by flow UUID.
pub struct Table {
    node_tid: String,
    expire: Duration,
    inner: Mutex<TableInner>,
}

#[derive(Default)]
struct TableInner {
    flows: Vec<Flow>,
    /// Cumulative counters at the previous update tick, per flow UUID.
    tick_snapshot: HashMap<String, FlowMetric>,
}

impl Table {
    pub fn new(node_tid: impl Into<String>, expire: Duration) -> Self {
        Self {
            node_tid: node_tid.into(),
            expire,
            inner: Mutex::new(TableInner::default()),
        }
    }

    pub fn node_tid(&self) -> &str {
        &self.node_tid
    }

    /// Insert a new flow, or fold counters into an existing one.
    pub fn ingest(&self, flow: Flow) {
        let mut inner = self.lock();
        match inner.flows.iter_mut().find(|f| f.uuid == flow.uuid) {
            Some(existing) => {
                existing.metric = existing.metric.add(&flow.metric);
                existing.last = existing.last.max(flow.last);
            }
            None => inner.flows.push(flow),
        }
    }

    /// Roll the last-update window of every flow touched since the
    /// previous tick.
    pub fn update_tick(&self, now_ms: i64) {
        let mut inner = self.lock();
        let TableInner {
            flows,
            tick_snapshot,
        } = &mut *inner;
        for flow in flows.iter_mut() {
            let prev = tick_snapshot
                .get(&flow.uuid)
                .copied()
                .unwrap_or_default();
            let delta = flow.metric.sub(&prev);
            if !delta.is_zero() {
                flow.last_update_start = flow.last_update_last.max(flow.start);
                flow.last_update_last = now_ms;
                flow.last_update_metric = delta;
                flow.last = now_ms;
            }
            tick_snapshot.insert(flow.uuid.clone(), flow.metric);
        }
    }

    /// Drop flows idle past the expire interval.
    pub fn expire_flows(&self, now_ms: i64) {
        let deadline = now_ms - self.expire.as_millis() as i64;
        let mut inner = self.lock();
        let before = inner.flows.len();
        inner.flows.retain(|f| f.last >= deadline);
        let expired = before - inner.flows.len();
        if expired > 0 {
            let uuids: Vec<String> = inner
                .tick_snapshot
                .keys()
                .filter(|uuid| !inner.flows.iter().any(|f| &f.uuid == *uuid))
                .cloned()
                .collect();
            for uuid in uuids {
                inner.tick_snapshot.remove(&uuid);
            }
            debug!(node_tid = %self.node_tid, expired, "expired idle flows");
        }
    }

    /// Flows currently matching a filter, unsorted.
    pub fn matching(&self, filter: Option<&Filter>) -> Vec<Flow> {
        let inner = self.lock();
        inner
            .flows
            .iter()
            .filter(|f| filter.map(|flt| flt.matches(*f)).unwrap_or(true))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Allocates one table per capture point.
pub struct TableAllocator {
    host: String,
    expire: Duration,
    tables: Mutex<HashMap<String, Arc<Table>>>,
}

impl TableAllocator {
    pub fn new(host: impl Into<String>, expire: Duration) -> Self {
        Self {
            host: host.into(),
            expire,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get or create the table for a capture point.
    pub fn alloc(&self, node_tid: &str) -> Arc<Table> {
        let mut tables = self.lock();
        tables
            .entry(node_tid.to_string())
            .or_insert_with(|| Arc::new(Table::new(node_tid, self.expire)))
            .clone()
    }

    /// Drop the table of an unregistered capture point.
    pub fn release(&self, node_tid: &str) {
        self.lock().remove(node_tid);
    }

    /// Collect matching flows across tables; `tids` restricts the scan
    /// to the named capture points.
    pub fn collect(&self, filter: Option<&Filter>, tids: Option<&[String]>) -> FlowSet {
        let tables = self.lock();
        let mut set = FlowSet::default();
        for (tid, table) in tables.iter() {
            if let Some(wanted) = tids {
                if !wanted.iter().any(|w| w == tid) {
                    continue;
                }
            }
            set.flows.extend(table.matching(filter));
        }
        set
    }

    /// Run expiry over every table.
    pub fn expire_all(&self, now_ms: i64) {
        for table in self.lock().values() {
            table.expire_flows(now_ms);
        }
    }

    /// Run the update tick over every table.
    pub fn update_all(&self, now_ms: i64) {
        for table in self.lock().values() {
            table.update_tick(now_ms);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Table>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowLayer;

    fn flow(node_tid: &str, a: &str, start: i64) -> Flow {
        Flow::new(
            "Ethernet/IPv4",
            None,
            Some(FlowLayer::new("IPV4", a, "10.0.0.254")),
            None,
            node_tid,
            start,
        )
    }

    #[test]
    fn ingest_merges_by_uuid() {
        let table = Table::new("tid-a", Duration::from_secs(600));
        let mut f = flow("tid-a", "10.0.0.1", 0);
        f.metric.ab_packets = 5;
        table.ingest(f.clone());

        let mut again = f.clone();
        again.metric.ab_packets = 3;
        again.last = 100;
        table.ingest(again);

        let flows = table.matching(None);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].metric.ab_packets, 8);
        assert_eq!(flows[0].last, 100);
    }

    #[test]
    fn update_tick_sets_delta_window() {
        let table = Table::new("tid-a", Duration::from_secs(600));
        let mut f = flow("tid-a", "10.0.0.1", 0);
        f.metric.ab_packets = 5;
        table.ingest(f.clone());

        table.update_tick(1000);
        let flows = table.matching(None);
        assert_eq!(flows[0].last_update_metric.ab_packets, 5);
        assert_eq!(flows[0].last_update_last, 1000);

        // No traffic since the tick: window untouched.
        table.update_tick(2000);
        let flows = table.matching(None);
        assert_eq!(flows[0].last_update_last, 1000);
    }

    #[test]
    fn expiry_drops_idle_flows() {
        let table = Table::new("tid-a", Duration::from_secs(10));
        table.ingest(flow("tid-a", "10.0.0.1", 0));
        table.ingest(flow("tid-a", "10.0.0.2", 95_000));

        table.expire_flows(100_000);
        let flows = table.matching(None);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].network.as_ref().unwrap().a, "10.0.0.2");
    }

    #[test]
    fn allocator_collects_across_tables() {
        let allocator = TableAllocator::new("agent-1", Duration::from_secs(600));
        allocator.alloc("tid-a").ingest(flow("tid-a", "10.0.0.1", 0));
        allocator.alloc("tid-b").ingest(flow("tid-b", "10.0.0.2", 0));

        assert_eq!(allocator.collect(None, None).len(), 2);
        assert_eq!(
            allocator
                .collect(None, Some(&["tid-a".to_string()]))
                .len(),
            1
        );

        allocator.release("tid-a");
        assert_eq!(allocator.collect(None, None).len(), 1);
    }
}
