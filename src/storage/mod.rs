pub mod json_store;
pub mod memory_store;
pub mod sqlite_store;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::types::{FlowSnapshot, FlowStatus, FlowSummary};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("flow not found: {flow_id}")]
    NotFound { flow_id: String },

    #[error("flow already exists: {flow_id}")]
    AlreadyExists { flow_id: String },

    #[error("version conflict on flow {flow_id}: expected {expected}, stored {actual}")]
    VersionConflict {
        flow_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("corrupt snapshot for flow {flow_id}: {source}")]
    Corrupt {
        flow_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Filter applied by `list`. Empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowFilter {
    pub status: Option<FlowStatus>,
    pub flow_type: Option<String>,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl FlowFilter {
    pub fn matches(&self, summary: &FlowSummary) -> bool {
        if let Some(status) = self.status
            && summary.status != status
        {
            return false;
        }
        if let Some(ref flow_type) = self.flow_type
            && &summary.flow_type != flow_type
        {
            return false;
        }
        if let Some(ref user_id) = self.user_id
            && summary.user_id.as_ref() != Some(user_id)
        {
            return false;
        }
        if let Some(ref correlation_id) = self.correlation_id
            && summary.correlation_id.as_ref() != Some(correlation_id)
        {
            return false;
        }
        if let Some(after) = self.created_after
            && summary.created_at < after
        {
            return false;
        }
        if let Some(before) = self.created_before
            && summary.created_at >= before
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// One page of flow summaries, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowPage {
    pub items: Vec<FlowSummary>,
    pub total: u64,
    pub offset: usize,
    pub limit: usize,
}

/// Durable persistence of flow snapshots keyed by flow id, with
/// compare-and-swap updates on the per-flow version counter.
///
/// The CAS discipline is the sole inter-process concurrency guard: a writer
/// whose expected version no longer matches must discard its in-memory state
/// and reload.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Persist the initial snapshot of a new flow.
    async fn insert(&self, snapshot: &FlowSnapshot) -> Result<(), StoreError>;

    /// CAS write: succeeds only when the stored version equals
    /// `expected_version`; `snapshot.version` must already be bumped past it.
    async fn update(&self, snapshot: &FlowSnapshot, expected_version: u64)
    -> Result<(), StoreError>;

    async fn load(&self, flow_id: &str) -> Result<Option<FlowSnapshot>, StoreError>;

    /// Filtered, paged listing of summaries, newest first.
    async fn list(&self, filter: &FlowFilter, page: &Pagination) -> Result<FlowPage, StoreError>;

    /// Every flow whose status is not terminal. Restore scans this on start.
    async fn list_non_terminal(&self) -> Result<Vec<FlowSnapshot>, StoreError>;

    async fn counts_by_status(&self) -> Result<BTreeMap<FlowStatus, u64>, StoreError>;

    /// Returns true when a record was removed.
    async fn delete(&self, flow_id: &str) -> Result<bool, StoreError>;

    /// Maintenance sweep: remove terminal flows created before `cutoff`.
    /// Returns the number of flows removed.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Shared by the scan-based stores: page a filtered summary list.
pub(crate) fn page_summaries(
    mut summaries: Vec<FlowSummary>,
    filter: &FlowFilter,
    page: &Pagination,
) -> FlowPage {
    summaries.retain(|s| filter.matches(s));
    summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let total = summaries.len() as u64;
    let items = summaries
        .into_iter()
        .skip(page.offset)
        .take(page.limit)
        .collect();
    FlowPage {
        items,
        total,
        offset: page.offset,
        limit: page.limit,
    }
}
