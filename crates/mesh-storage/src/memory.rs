//! In-memory flow store, for tests and storage-less agents.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use mesh_core::{Filter, SearchQuery};
use mesh_flow::{Flow, FlowSet, TimedMetric};

use crate::{sample_of, FlowStorage, StorageResult};

#[derive(Default)]
struct MemoryInner {
    /// Stored flows in first-seen order, newest state per UUID.
    flows: Vec<Flow>,
    /// Metric samples per flow UUID, in arrival order.
    metrics: HashMap<String, Vec<TimedMetric>>,
}

#[derive(Default)]
pub struct MemoryFlowStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryFlowStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FlowStorage for MemoryFlowStorage {
    fn store_flows(&self, flows: &[Flow]) -> StorageResult<()> {
        let mut inner = self.lock();
        for flow in flows {
            match inner.flows.iter_mut().find(|f| f.uuid == flow.uuid) {
                Some(existing) => *existing = flow.clone(),
                None => inner.flows.push(flow.clone()),
            }
            let sample = sample_of(flow);
            if !sample.metric.is_zero() {
                inner
                    .metrics
                    .entry(flow.uuid.clone())
                    .or_default()
                    .push(sample);
            }
        }
        Ok(())
    }

    fn search_flows(&self, query: &SearchQuery) -> StorageResult<FlowSet> {
        let flows = self.lock().flows.clone();
        Ok(FlowSet::new(flows).apply_query(query)?)
    }

    fn search_metrics(
        &self,
        query: &SearchQuery,
        range: &Filter,
    ) -> StorageResult<HashMap<String, Vec<TimedMetric>>> {
        let inner = self.lock();
        let mut result = HashMap::new();
        for flow in &inner.flows {
            if let Some(filter) = &query.filter {
                if !filter.matches(flow) {
                    continue;
                }
            }
            let samples: Vec<TimedMetric> = inner
                .metrics
                .get(&flow.uuid)
                .into_iter()
                .flatten()
                .filter(|sample| range.matches(*sample))
                .cloned()
                .collect();
            if !samples.is_empty() {
                let mut samples = samples;
                samples.sort_by_key(|s| s.start);
                result.insert(flow.uuid.clone(), samples);
            }
        }
        Ok(result)
    }
}
