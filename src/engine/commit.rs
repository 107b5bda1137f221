use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::engine::types::FlowSnapshot;
use crate::events::{EngineEvent, EventBus};
use crate::storage::{FlowStore, StoreError};

const BACKEND_RETRIES: u32 = 3;
const BACKEND_BACKOFF_MS: u64 = 100;

/// Write-through persistence for scheduler transitions.
///
/// Every externally observable transition goes through one commit: bump the
/// snapshot version, CAS-write against the prior version, then publish the
/// bus messages carrying the new version. A failed commit rolls the version
/// bump back so the caller can reload and re-evaluate.
pub struct Persister {
    store: Arc<dyn FlowStore>,
    bus: Arc<EventBus>,
}

impl Persister {
    pub fn new(store: Arc<dyn FlowStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Persist the first snapshot of a new flow and publish its messages.
    pub async fn insert_initial<F>(
        &self,
        flow: &mut FlowSnapshot,
        build: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&FlowSnapshot) -> Vec<EngineEvent>,
    {
        flow.version = 1;
        self.store.insert(flow).await?;
        for message in build(flow) {
            self.bus.publish(message);
        }
        Ok(())
    }

    /// Commit an already-applied in-memory transition.
    pub async fn commit<F>(&self, flow: &mut FlowSnapshot, build: F) -> Result<(), StoreError>
    where
        F: FnOnce(&FlowSnapshot) -> Vec<EngineEvent>,
    {
        let expected = flow.version;
        flow.version += 1;

        match self.write_with_backoff(flow, expected).await {
            Ok(()) => {
                for message in build(flow) {
                    self.bus.publish(message);
                }
                Ok(())
            }
            Err(e) => {
                flow.version = expected;
                Err(e)
            }
        }
    }

    /// Transient backend faults are retried with bounded backoff; CAS
    /// conflicts and missing records are surfaced immediately.
    async fn write_with_backoff(
        &self,
        flow: &FlowSnapshot,
        expected: u64,
    ) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.update(flow, expected).await {
                Ok(()) => return Ok(()),
                Err(e @ (StoreError::Backend(_) | StoreError::Io(_))) => {
                    attempt += 1;
                    if attempt > BACKEND_RETRIES {
                        return Err(e);
                    }
                    let delay = BACKEND_BACKOFF_MS * 2u64.pow(attempt - 1);
                    warn!(
                        flow_id = %flow.flow_id,
                        attempt = attempt,
                        error = %e,
                        "Snapshot write failed — backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
