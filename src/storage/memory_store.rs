use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::types::{FlowSnapshot, FlowStatus};
use crate::storage::{FlowFilter, FlowPage, FlowStore, Pagination, StoreError, page_summaries};

/// In-memory store. Used by tests and by embedded child engines; state lives
/// only as long as the store instance.
pub struct MemoryStore {
    flows: Mutex<HashMap<String, FlowSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn insert(&self, snapshot: &FlowSnapshot) -> Result<(), StoreError> {
        let mut flows = self.flows.lock().unwrap();
        if flows.contains_key(&snapshot.flow_id) {
            return Err(StoreError::AlreadyExists {
                flow_id: snapshot.flow_id.clone(),
            });
        }
        flows.insert(snapshot.flow_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn update(
        &self,
        snapshot: &FlowSnapshot,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut flows = self.flows.lock().unwrap();
        let stored = flows
            .get_mut(&snapshot.flow_id)
            .ok_or_else(|| StoreError::NotFound {
                flow_id: snapshot.flow_id.clone(),
            })?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                flow_id: snapshot.flow_id.clone(),
                expected: expected_version,
                actual: stored.version,
            });
        }
        *stored = snapshot.clone();
        Ok(())
    }

    async fn load(&self, flow_id: &str) -> Result<Option<FlowSnapshot>, StoreError> {
        Ok(self.flows.lock().unwrap().get(flow_id).cloned())
    }

    async fn list(&self, filter: &FlowFilter, page: &Pagination) -> Result<FlowPage, StoreError> {
        let summaries = self
            .flows
            .lock()
            .unwrap()
            .values()
            .map(FlowSnapshot::summary)
            .collect();
        Ok(page_summaries(summaries, filter, page))
    }

    async fn list_non_terminal(&self) -> Result<Vec<FlowSnapshot>, StoreError> {
        Ok(self
            .flows
            .lock()
            .unwrap()
            .values()
            .filter(|f| !f.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn counts_by_status(&self) -> Result<BTreeMap<FlowStatus, u64>, StoreError> {
        let mut counts = BTreeMap::new();
        for flow in self.flows.lock().unwrap().values() {
            *counts.entry(flow.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete(&self, flow_id: &str) -> Result<bool, StoreError> {
        Ok(self.flows.lock().unwrap().remove(flow_id).is_some())
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut flows = self.flows.lock().unwrap();
        let before = flows.len();
        flows.retain(|_, f| !(f.status.is_terminal() && f.created_at < cutoff));
        Ok((before - flows.len()) as u64)
    }
}
