//! redb-backed flow store.
//!
//! Flows and their metric samples are JSON-serialized into redb's
//! `&[u8]` value columns, one table each, keyed by flow UUID. Searches
//! scan; the store is sized for analyzer retention windows, not
//! analytics workloads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use mesh_core::{Filter, SearchQuery};
use mesh_flow::{Flow, FlowSet, TimedMetric};

use crate::{sample_of, FlowStorage, StorageError, StorageResult};

const FLOWS: TableDefinition<&str, &[u8]> = TableDefinition::new("flows");
const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("flow_metrics");

/// Convert any `Display` error into a `StorageError` variant via a
/// closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StorageError::$variant(e.to_string())
    };
}

/// Durable flow store backed by redb.
#[derive(Clone)]
pub struct RedbFlowStorage {
    db: Arc<Database>,
}

impl RedbFlowStorage {
    /// Open (or create) a persistent flow store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let db = Database::create(path).map_err(map_err!(Unavailable))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "flow store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory flow store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Unavailable))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory flow store opened");
        Ok(store)
    }

    /// Create both tables if they don't exist yet.
    fn ensure_tables(&self) -> StorageResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        txn.open_table(FLOWS).map_err(map_err!(Unavailable))?;
        txn.open_table(METRICS).map_err(map_err!(Unavailable))?;
        txn.commit().map_err(map_err!(Unavailable))?;
        Ok(())
    }

    fn load_flows(&self) -> StorageResult<Vec<Flow>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = txn.open_table(FLOWS).map_err(map_err!(Unavailable))?;
        let mut flows = Vec::new();
        for entry in table.iter().map_err(map_err!(Unavailable))? {
            let (_, value) = entry.map_err(map_err!(Unavailable))?;
            let flow: Flow =
                serde_json::from_slice(value.value()).map_err(map_err!(Serialize))?;
            flows.push(flow);
        }
        Ok(flows)
    }

    fn load_samples(&self, uuid: &str) -> StorageResult<Vec<TimedMetric>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = txn.open_table(METRICS).map_err(map_err!(Unavailable))?;
        match table.get(uuid).map_err(map_err!(Unavailable))? {
            Some(value) => {
                serde_json::from_slice(value.value()).map_err(map_err!(Serialize))
            }
            None => Ok(Vec::new()),
        }
    }
}

impl FlowStorage for RedbFlowStorage {
    fn store_flows(&self, flows: &[Flow]) -> StorageResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        {
            let mut flow_table = txn.open_table(FLOWS).map_err(map_err!(Unavailable))?;
            let mut metric_table = txn.open_table(METRICS).map_err(map_err!(Unavailable))?;

            for flow in flows {
                let encoded = serde_json::to_vec(flow).map_err(map_err!(Serialize))?;
                flow_table
                    .insert(flow.uuid.as_str(), encoded.as_slice())
                    .map_err(map_err!(Unavailable))?;

                let sample = sample_of(flow);
                if sample.metric.is_zero() {
                    continue;
                }
                let mut samples: Vec<TimedMetric> = match metric_table
                    .get(flow.uuid.as_str())
                    .map_err(map_err!(Unavailable))?
                {
                    Some(value) => {
                        serde_json::from_slice(value.value()).map_err(map_err!(Serialize))?
                    }
                    None => Vec::new(),
                };
                samples.push(sample);
                let encoded = serde_json::to_vec(&samples).map_err(map_err!(Serialize))?;
                metric_table
                    .insert(flow.uuid.as_str(), encoded.as_slice())
                    .map_err(map_err!(Unavailable))?;
            }
        }
        txn.commit().map_err(map_err!(Unavailable))?;
        debug!(count = flows.len(), "flows stored");
        Ok(())
    }

    fn search_flows(&self, query: &SearchQuery) -> StorageResult<FlowSet> {
        let flows = self.load_flows()?;
        Ok(FlowSet::new(flows).apply_query(query)?)
    }

    fn search_metrics(
        &self,
        query: &SearchQuery,
        range: &Filter,
    ) -> StorageResult<HashMap<String, Vec<TimedMetric>>> {
        let mut result = HashMap::new();
        for flow in self.load_flows()? {
            if let Some(filter) = &query.filter {
                if !filter.matches(&flow) {
                    continue;
                }
            }
            let mut samples: Vec<TimedMetric> = self
                .load_samples(&flow.uuid)?
                .into_iter()
                .filter(|sample| range.matches(sample))
                .collect();
            if !samples.is_empty() {
                samples.sort_by_key(|s| s.start);
                result.insert(flow.uuid, samples);
            }
        }
        Ok(result)
    }
}
