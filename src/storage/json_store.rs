use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::engine::types::{FlowSnapshot, FlowStatus};
use crate::storage::{FlowFilter, FlowPage, FlowStore, Pagination, StoreError, page_summaries};

/// File-based store. Each flow is one JSON file; writes go through a
/// temp-file rename so a crash never leaves a half-written snapshot.
pub struct JsonStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn flow_path(&self, flow_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", flow_id))
    }

    async fn read_flow(&self, flow_id: &str) -> Result<Option<FlowSnapshot>, StoreError> {
        let path = self.flow_path(flow_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot =
            serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
                flow_id: flow_id.to_string(),
                source,
            })?;
        Ok(Some(snapshot))
    }

    async fn write_flow(&self, snapshot: &FlowSnapshot) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.flow_path(&snapshot.flow_id);
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(snapshot).map_err(|source| StoreError::Corrupt {
            flow_id: snapshot.flow_id.clone(),
            source,
        })?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<FlowSnapshot>, StoreError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut flows = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Ok(data) = tokio::fs::read_to_string(&path).await
                && let Ok(snapshot) = serde_json::from_str::<FlowSnapshot>(&data)
            {
                flows.push(snapshot);
            }
        }
        Ok(flows)
    }
}

#[async_trait]
impl FlowStore for JsonStore {
    async fn insert(&self, snapshot: &FlowSnapshot) -> Result<(), StoreError> {
        let _lock = self.lock.write().await;
        if self.flow_path(&snapshot.flow_id).exists() {
            return Err(StoreError::AlreadyExists {
                flow_id: snapshot.flow_id.clone(),
            });
        }
        self.write_flow(snapshot).await
    }

    async fn update(
        &self,
        snapshot: &FlowSnapshot,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let _lock = self.lock.write().await;
        let stored = self
            .read_flow(&snapshot.flow_id)
            .await?
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
        self.write_flow(snapshot).await
    }

    async fn load(&self, flow_id: &str) -> Result<Option<FlowSnapshot>, StoreError> {
        let _lock = self.lock.read().await;
        self.read_flow(flow_id).await
    }

    async fn list(&self, filter: &FlowFilter, page: &Pagination) -> Result<FlowPage, StoreError> {
        let _lock = self.lock.read().await;
        let summaries = self.scan().await?.iter().map(FlowSnapshot::summary).collect();
        Ok(page_summaries(summaries, filter, page))
    }

    async fn list_non_terminal(&self) -> Result<Vec<FlowSnapshot>, StoreError> {
        let _lock = self.lock.read().await;
        let mut flows = self.scan().await?;
        flows.retain(|f| !f.status.is_terminal());
        Ok(flows)
    }

    async fn counts_by_status(&self) -> Result<BTreeMap<FlowStatus, u64>, StoreError> {
        let _lock = self.lock.read().await;
        let mut counts = BTreeMap::new();
        for flow in self.scan().await? {
            *counts.entry(flow.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete(&self, flow_id: &str) -> Result<bool, StoreError> {
        let _lock = self.lock.write().await;
        let path = self.flow_path(flow_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let _lock = self.lock.write().await;
        let mut removed = 0;
        for flow in self.scan().await? {
            if flow.status.is_terminal() && flow.created_at < cutoff {
                tokio::fs::remove_file(self.flow_path(&flow.flow_id)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
