//! FlowSet — an in-memory collection of flow records.
//!
//! Not thread-safe; a query holds exclusive access for its duration.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use mesh_core::{FieldGetter, Filter, SearchQuery, SortOrder};

use crate::flow::{Flow, FlowError, FlowResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSet {
    #[serde(rename = "Flows")]
    pub flows: Vec<Flow>,
}

impl FlowSet {
    pub fn new(flows: Vec<Flow>) -> Self {
        Self { flows }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Keep only flows satisfying the filter.
    pub fn filter(&self, filter: &Filter) -> FlowSet {
        FlowSet {
            flows: self
                .flows
                .iter()
                .filter(|f| filter.matches(*f))
                .cloned()
                .collect(),
        }
    }

    /// First-wins deduplication by the given key (flow UUID when None).
    /// Order of first occurrences is preserved.
    pub fn dedup(&mut self, key: Option<&str>) -> FlowResult<()> {
        let key = key.unwrap_or("UUID");
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(self.flows.len());
        for flow in self.flows.drain(..) {
            let value = flow
                .get_field_string(key)
                .or_else(|_| flow.get_field_int64(key).map(|v| v.to_string()))
                .map_err(|_| FlowError::UnknownField(key.to_string()))?;
            if seen.insert(value) {
                kept.push(flow);
            }
        }
        self.flows = kept;
        Ok(())
    }

    /// Stable sort by the given key.
    pub fn sort(&mut self, order: SortOrder, key: &str) {
        self.flows.sort_by(|a, b| {
            let ordering = compare_field(a, b, key);
            match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });
    }

    /// Keep the half-open window `[from, to)`, clamped to bounds.
    pub fn slice(&mut self, from: i64, to: i64) {
        let len = self.flows.len() as i64;
        let from = from.clamp(0, len) as usize;
        let to = to.clamp(0, len) as usize;
        if from >= to {
            self.flows.clear();
        } else {
            self.flows = self.flows.drain(from..to).collect();
        }
    }

    pub fn merge(&mut self, other: FlowSet) {
        self.flows.extend(other.flows);
    }

    /// Apply a full search query: filter, then stable sort, then dedup,
    /// then pagination. Dedup always happens before pagination.
    pub fn apply_query(mut self, query: &SearchQuery) -> FlowResult<FlowSet> {
        if let Some(filter) = &query.filter {
            self = self.filter(filter);
        }
        if query.sort {
            let key = query.sort_by.as_deref().unwrap_or("Last");
            self.sort(query.sort_order, key);
        }
        if query.dedup {
            self.dedup(query.dedup_by.as_deref())?;
        }
        if let Some(range) = &query.pagination {
            self.slice(range.from, range.to);
        }
        Ok(self)
    }
}

fn compare_field(a: &Flow, b: &Flow, key: &str) -> Ordering {
    match (a.get_field_int64(key), b.get_field_int64(key)) {
        (Ok(av), Ok(bv)) => av.cmp(&bv),
        _ => match (a.get_field_string(key), b.get_field_string(key)) {
            (Ok(av), Ok(bv)) => av.cmp(&bv),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => Ordering::Equal,
        },
    }
}
