use std::sync::Arc;

use futures_util::Stream;
use futures_util::stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::engine::errors::{EngineError, EngineResult};
use crate::engine::types::FlowSnapshot;
use crate::events::{EngineEvent, EventBus};
use crate::storage::FlowStore;

/// One item pushed to a per-flow observer.
#[derive(Debug, Clone)]
pub enum LiveUpdate {
    /// Full state. Sent on subscription and again after any gap, before
    /// further deltas.
    Snapshot(Box<FlowSnapshot>),
    /// Incremental status change; idempotent on `version`.
    Delta(EngineEvent),
}

/// Push surface for external observers. Delivery is at-least-once:
/// duplicates are possible and consumers must be idempotent on the snapshot
/// version carried by every message.
pub struct LiveUpdateChannel {
    bus: Arc<EventBus>,
    store: Arc<dyn FlowStore>,
}

impl LiveUpdateChannel {
    pub fn new(bus: Arc<EventBus>, store: Arc<dyn FlowStore>) -> Self {
        Self { bus, store }
    }

    /// Subscribe to a single flow: the current snapshot first, then deltas.
    ///
    /// The bus subscription opens before the snapshot read; the earliest
    /// deltas may duplicate state the snapshot already covers.
    pub async fn subscribe_flow(
        &self,
        flow_id: &str,
    ) -> EngineResult<impl Stream<Item = LiveUpdate>> {
        let updates = self.bus.subscribe_flow(flow_id);
        let snapshot = self
            .store
            .load(flow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(flow_id.to_string()))?;

        let store = self.store.clone();
        let flow_id = flow_id.to_string();

        enum State {
            Initial(Box<FlowSnapshot>),
            Tailing,
        }

        Ok(stream::unfold(
            (State::Initial(Box::new(snapshot)), updates, store, flow_id),
            |(state, mut updates, store, flow_id)| async move {
                match state {
                    State::Initial(snapshot) => Some((
                        LiveUpdate::Snapshot(snapshot),
                        (State::Tailing, updates, store, flow_id),
                    )),
                    State::Tailing => match updates.recv().await {
                        Ok(event) => Some((
                            LiveUpdate::Delta(event),
                            (State::Tailing, updates, store, flow_id),
                        )),
                        // Missed messages: deliver full state again before
                        // any further deltas.
                        Err(RecvError::Lagged(_)) => {
                            let snapshot = store.load(&flow_id).await.ok().flatten()?;
                            Some((
                                LiveUpdate::Snapshot(Box::new(snapshot)),
                                (State::Tailing, updates, store, flow_id),
                            ))
                        }
                        Err(RecvError::Closed) => None,
                    },
                }
            },
        ))
    }

    /// Subscribe to every flow's status and step updates, plus batch
    /// aggregates. Lags are skipped; admin observers reconcile via listings.
    pub fn subscribe_admin(&self) -> impl Stream<Item = EngineEvent> + use<> {
        let updates = self.bus.subscribe_admin();
        stream::unfold(updates, |mut updates| async move {
            loop {
                match updates.recv().await {
                    Ok(event) => return Some((event, updates)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Raw admin receiver, without the snapshot-first stream wrapping.
    pub fn raw_admin(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe_admin()
    }
}
