use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::StepCatalog;
use crate::context::{DataContext, DataMap};
use crate::engine::commit::Persister;
use crate::engine::config::EngineConfig;
use crate::engine::errors::{EngineError, EngineResult};
use crate::engine::scheduler::{Scheduler, SchedulerHandle, SchedulerHost};
use crate::engine::types::{
    FlowEventType, FlowSnapshot, FlowStatus, PauseReason, StepStatus, TriggerRequest, TriggeredBy,
};
use crate::events::{BatchItemResult, EngineEvent, EventBus};
use crate::events::live::LiveUpdateChannel;
use crate::storage::{FlowFilter, FlowPage, FlowStore, Pagination};

/// Optional attributes of a new flow.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub triggered_by: Option<TriggeredBy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOperation {
    Pause,
    Resume,
    Cancel,
    Retry,
}

impl std::fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchOperation::Pause => write!(f, "pause"),
            BatchOperation::Resume => write!(f, "resume"),
            BatchOperation::Cancel => write!(f, "cancel"),
            BatchOperation::Retry => write!(f, "retry"),
        }
    }
}

/// Aggregate result of a batch operation, also published on the admin bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub operation: BatchOperation,
    pub success_count: usize,
    pub failure_count: usize,
    pub results: Vec<BatchItemResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStatistics {
    pub total: u64,
    pub counts: BTreeMap<FlowStatus, u64>,
}

/// The orchestrator surface exposed to the application.
///
/// Cheap to clone; all operations translate into scheduler transitions and
/// are subject to the flow state machine.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    catalog: Arc<StepCatalog>,
    store: Arc<dyn FlowStore>,
    bus: Arc<EventBus>,
    persister: Arc<Persister>,
    config: Arc<EngineConfig>,
    live: LiveUpdateChannel,
    handles: Mutex<HashMap<String, SchedulerHandle>>,
    /// Self-reference so `&self` methods can hand owned `Arc`s to scheduler
    /// hosts and watcher tasks.
    self_ref: Weak<EngineInner>,
}

/// `SchedulerHost` needs owned `Arc`s to hand to watcher tasks, so the host
/// the schedulers see is this thin wrapper.
struct HostRef(Arc<EngineInner>);

impl FlowEngine {
    pub fn new(catalog: Arc<StepCatalog>, store: Arc<dyn FlowStore>, config: EngineConfig) -> Self {
        let bus = Arc::new(EventBus::new(config.bus_capacity));
        let persister = Arc::new(Persister::new(store.clone(), bus.clone()));
        let live = LiveUpdateChannel::new(bus.clone(), store.clone());
        Self {
            inner: Arc::new_cyclic(|self_ref| EngineInner {
                catalog,
                store,
                bus,
                persister,
                config: Arc::new(config),
                live,
                handles: Mutex::new(HashMap::new()),
                self_ref: self_ref.clone(),
            }),
        }
    }

    pub fn catalog(&self) -> &Arc<StepCatalog> {
        &self.inner.catalog
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The live update channel: per-flow and admin-wide subscriptions.
    pub fn live(&self) -> &LiveUpdateChannel {
        &self.inner.live
    }

    /// Start a new flow; returns its id. The initial snapshot is durable
    /// before this returns.
    pub async fn start(
        &self,
        flow_type: &str,
        initial_data: DataMap,
        options: StartOptions,
    ) -> EngineResult<String> {
        self.inner.start_flow(flow_type, initial_data, options).await
    }

    pub async fn get(&self, flow_id: &str) -> EngineResult<FlowSnapshot> {
        self.inner.load(flow_id).await
    }

    pub async fn list(&self, filter: &FlowFilter, page: &Pagination) -> EngineResult<FlowPage> {
        Ok(self.inner.store.list(filter, page).await?)
    }

    pub async fn statistics(&self) -> EngineResult<FlowStatistics> {
        let counts = self.inner.store.counts_by_status().await?;
        let total = counts.values().sum();
        Ok(FlowStatistics { total, counts })
    }

    /// Request a pause; applied at the next step boundary.
    pub async fn pause(&self, flow_id: &str, message: Option<String>) -> EngineResult<FlowSnapshot> {
        self.inner.pause(flow_id, message).await
    }

    pub async fn resume(&self, flow_id: &str) -> EngineResult<FlowSnapshot> {
        self.inner.resume(flow_id).await
    }

    /// Request cancellation. The running step is signalled immediately; the
    /// flow transitions once it returns.
    pub async fn cancel(&self, flow_id: &str, reason: &str) -> EngineResult<FlowSnapshot> {
        self.inner.cancel(flow_id, reason).await
    }

    /// Re-enter a failed flow: failing steps reset to pending with a fresh
    /// attempt budget.
    pub async fn retry(&self, flow_id: &str) -> EngineResult<FlowSnapshot> {
        self.inner.retry(flow_id).await
    }

    /// Administrative force-complete of a failed flow. Requires a reason;
    /// remaining steps stay skipped for auditability.
    pub async fn resolve(&self, flow_id: &str, reason: &str) -> EngineResult<FlowSnapshot> {
        self.inner.resolve(flow_id, reason).await
    }

    /// Apply one operation to many flows; per-item outcomes, published as a
    /// single aggregate message on the admin stream.
    pub async fn batch(
        &self,
        operation: BatchOperation,
        flow_ids: &[String],
    ) -> EngineResult<BatchOutcome> {
        self.inner.batch(operation, flow_ids).await
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

impl EngineInner {
    pub(crate) fn store_arc(&self) -> Arc<dyn FlowStore> {
        self.store.clone()
    }

    pub(crate) fn persister_arc(&self) -> Arc<Persister> {
        self.persister.clone()
    }

    fn arc(&self) -> Arc<EngineInner> {
        self.self_ref.upgrade().expect("engine is alive")
    }

    async fn load(&self, flow_id: &str) -> EngineResult<FlowSnapshot> {
        self.store
            .load(flow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(flow_id.to_string()))
    }

    async fn start_flow(
        &self,
        flow_type: &str,
        initial_data: DataMap,
        options: StartOptions,
    ) -> EngineResult<String> {
        let steps = self.catalog.instantiate(flow_type)?;
        let flow_id = Uuid::new_v4().to_string();

        let mut data = DataContext::new();
        for (key, value) in initial_data {
            data.seed(key, value);
        }

        let mut flow = FlowSnapshot::new(&flow_id, flow_type, steps, data);
        flow.correlation_id = options.correlation_id;
        flow.user_id = options.user_id;
        flow.triggered_by = options.triggered_by;

        debug!(
            flow_id = %flow_id,
            flow_type = %flow_type,
            total_steps = flow.total_steps,
            "Starting flow"
        );

        // Graph violations are detected at flow start: the flow is created
        // failed rather than rejected, so the fault is durable and visible.
        if let Err(message) = self.catalog.validate_graph(flow_type)? {
            for step in &mut flow.steps {
                step.status = StepStatus::Skipped;
                step.closed_out = true;
            }
            flow.status = FlowStatus::Failed;
            flow.completed_at = Some(Utc::now());
            flow.last_error = Some(message.clone());
            flow.push_event(
                FlowEventType::EngineFault,
                message,
                self.config.event_tail_limit,
            );
            self.persister
                .insert_initial(&mut flow, |f| vec![EngineEvent::flow_status(f)])
                .await?;
            return Ok(flow_id);
        }

        self.persister
            .insert_initial(&mut flow, |f| vec![EngineEvent::flow_status(f)])
            .await?;

        self.spawn_scheduler(flow)?;
        Ok(flow_id)
    }

    pub(crate) fn spawn_scheduler(&self, flow: FlowSnapshot) -> EngineResult<()> {
        let flow_id = flow.flow_id.clone();
        let host: Arc<dyn SchedulerHost> = Arc::new(HostRef(self.arc()));
        let (scheduler, handle) = Scheduler::new(
            flow,
            &self.catalog,
            self.persister.clone(),
            host,
            self.config.clone(),
        )?;

        let mut handles = self.handles.lock().unwrap();
        if handles.contains_key(&flow_id) {
            return Err(EngineError::Internal(format!(
                "flow {} already has a live scheduler",
                flow_id
            )));
        }
        handles.insert(flow_id, handle);
        scheduler.spawn();
        Ok(())
    }

    fn has_live_scheduler(&self, flow_id: &str) -> bool {
        self.handles.lock().unwrap().contains_key(flow_id)
    }

    async fn pause(&self, flow_id: &str, message: Option<String>) -> EngineResult<FlowSnapshot> {
        let flow = self.load(flow_id).await?;
        match flow.status {
            FlowStatus::Initializing | FlowStatus::Ready | FlowStatus::Running => {
                let requested = {
                    let handles = self.handles.lock().unwrap();
                    handles
                        .get(flow_id)
                        .map(|h| h.request_pause(message.clone()))
                        .unwrap_or(false)
                };
                if requested {
                    debug!(flow_id = %flow_id, "Pause requested");
                    self.load(flow_id).await
                } else {
                    // No live scheduler (e.g. after a crash before restore):
                    // pause administratively so the state is truthful.
                    let mut flow = flow;
                    flow.status = FlowStatus::Paused;
                    flow.pause_reason = Some(PauseReason::Manual);
                    flow.pause_message = message;
                    flow.paused_at = Some(Utc::now());
                    flow.push_event(
                        FlowEventType::FlowPaused,
                        "flow paused (manual)",
                        self.config.event_tail_limit,
                    );
                    self.persister
                        .commit(&mut flow, |f| vec![EngineEvent::flow_status(f)])
                        .await?;
                    Ok(flow)
                }
            }
            status => Err(EngineError::InvalidTransition { op: "pause", status }),
        }
    }

    pub(crate) async fn resume(&self, flow_id: &str) -> EngineResult<FlowSnapshot> {
        let flow = self.load(flow_id).await?;
        match flow.status {
            FlowStatus::Paused => {
                if self.has_live_scheduler(flow_id) {
                    return Err(EngineError::InvalidTransition {
                        op: "resume",
                        status: FlowStatus::Running,
                    });
                }
                info!(flow_id = %flow_id, "Resuming flow");
                self.spawn_scheduler(flow)?;
                self.load(flow_id).await
            }
            status => Err(EngineError::InvalidTransition {
                op: "resume",
                status,
            }),
        }
    }

    async fn cancel(&self, flow_id: &str, reason: &str) -> EngineResult<FlowSnapshot> {
        let flow = self.load(flow_id).await?;
        if flow.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                op: "cancel",
                status: flow.status,
            });
        }

        let requested = {
            let handles = self.handles.lock().unwrap();
            handles
                .get(flow_id)
                .map(|h| h.request_cancel(reason.to_string()))
                .unwrap_or(false)
        };
        if requested {
            debug!(flow_id = %flow_id, reason = %reason, "Cancel requested");
            return self.load(flow_id).await;
        }

        // Paused or orphaned flow: cancel administratively.
        let mut flow = flow;
        for step in &mut flow.steps {
            if !step.status.is_terminal() {
                step.status = StepStatus::Skipped;
                step.resume_at = None;
                step.closed_out = true;
            }
        }
        flow.status = FlowStatus::Cancelled;
        flow.completed_at = Some(Utc::now());
        flow.push_event(
            FlowEventType::FlowCancelled,
            format!("flow cancelled: {}", reason),
            self.config.event_tail_limit,
        );
        info!(flow_id = %flow_id, reason = %reason, "Flow cancelled");
        self.persister
            .commit(&mut flow, |f| vec![EngineEvent::flow_status(f)])
            .await?;
        Ok(flow)
    }

    async fn retry(&self, flow_id: &str) -> EngineResult<FlowSnapshot> {
        let mut flow = self.load(flow_id).await?;
        if flow.status != FlowStatus::Failed {
            return Err(EngineError::InvalidTransition {
                op: "retry",
                status: flow.status,
            });
        }

        for step in &mut flow.steps {
            let revive = step.status == StepStatus::Failed
                || (step.status == StepStatus::Skipped && step.closed_out);
            if revive {
                step.reset_for_retry();
                step.attempts = 0;
                step.closed_out = false;
            }
        }
        flow.status = FlowStatus::Running;
        flow.last_error = None;
        flow.completed_at = None;
        flow.push_event(
            FlowEventType::FlowResumed,
            "flow retried",
            self.config.event_tail_limit,
        );
        info!(flow_id = %flow_id, "Retrying failed flow");
        self.persister
            .commit(&mut flow, |f| vec![EngineEvent::flow_status(f)])
            .await?;

        self.spawn_scheduler(flow.clone())?;
        Ok(flow)
    }

    async fn resolve(&self, flow_id: &str, reason: &str) -> EngineResult<FlowSnapshot> {
        if reason.trim().is_empty() {
            return Err(EngineError::Internal(
                "resolve requires a reason".to_string(),
            ));
        }
        let mut flow = self.load(flow_id).await?;
        if flow.status != FlowStatus::Failed {
            return Err(EngineError::InvalidTransition {
                op: "resolve",
                status: flow.status,
            });
        }

        flow.status = FlowStatus::Completed;
        flow.completed_at = Some(Utc::now());
        flow.push_event(
            FlowEventType::ManuallyResolved,
            format!("flow manually resolved: {}", reason),
            self.config.event_tail_limit,
        );
        warn!(flow_id = %flow_id, reason = %reason, "Flow manually resolved");
        self.persister
            .commit(&mut flow, |f| vec![EngineEvent::flow_status(f)])
            .await?;
        Ok(flow)
    }

    async fn batch(
        &self,
        operation: BatchOperation,
        flow_ids: &[String],
    ) -> EngineResult<BatchOutcome> {
        let mut results = Vec::with_capacity(flow_ids.len());
        for flow_id in flow_ids {
            let result = match operation {
                BatchOperation::Pause => self.pause(flow_id, None).await.map(|_| ()),
                BatchOperation::Resume => self.resume(flow_id).await.map(|_| ()),
                BatchOperation::Cancel => self.cancel(flow_id, "batch cancel").await.map(|_| ()),
                BatchOperation::Retry => self.retry(flow_id).await.map(|_| ()),
            };
            results.push(match result {
                Ok(()) => BatchItemResult {
                    flow_id: flow_id.clone(),
                    ok: true,
                    error: None,
                },
                Err(e) => BatchItemResult {
                    flow_id: flow_id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                },
            });
        }

        let success_count = results.iter().filter(|r| r.ok).count();
        let outcome = BatchOutcome {
            operation,
            success_count,
            failure_count: results.len() - success_count,
            results: results.clone(),
        };
        self.bus.publish(EngineEvent::BatchResult {
            operation: operation.to_string(),
            success_count: outcome.success_count,
            failure_count: outcome.failure_count,
            results,
        });
        Ok(outcome)
    }

    /// One-shot watcher resuming a parent once its children are terminal.
    pub(crate) fn arm_child_watcher(&self, parent_flow_id: String, child_ids: Vec<String>) {
        let inner = self.arc();
        tokio::spawn(async move {
            // Subscribe before the initial store check so a child finishing
            // in between is not missed.
            let mut updates = inner.bus.subscribe_admin();
            let mut pending: HashSet<String> = child_ids.into_iter().collect();

            let ids: Vec<String> = pending.iter().cloned().collect();
            for id in ids {
                if let Ok(Some(snapshot)) = inner.store.load(&id).await
                    && snapshot.status.is_terminal()
                {
                    pending.remove(&id);
                }
            }

            while !pending.is_empty() {
                match updates.recv().await {
                    Ok(EngineEvent::FlowStatusChanged {
                        flow_id,
                        new_status,
                        ..
                    }) if new_status.is_terminal() => {
                        pending.remove(&flow_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        let ids: Vec<String> = pending.iter().cloned().collect();
                        for id in ids {
                            if let Ok(Some(snapshot)) = inner.store.load(&id).await
                                && snapshot.status.is_terminal()
                            {
                                pending.remove(&id);
                            }
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }

            info!(flow_id = %parent_flow_id, "Child flows terminal — resuming parent");
            match inner.resume(&parent_flow_id).await {
                Ok(_) => {}
                Err(EngineError::InvalidTransition { .. }) => {
                    // Parent moved on (cancelled or already resumed).
                }
                Err(e) => {
                    warn!(flow_id = %parent_flow_id, error = %e, "Failed to resume parent flow");
                }
            }
        });
    }
}

#[async_trait]
impl SchedulerHost for HostRef {
    async fn spawn_child(
        &self,
        request: TriggerRequest,
        triggered_by: TriggeredBy,
        correlation_id: Option<String>,
        user_id: Option<String>,
    ) -> EngineResult<String> {
        self.0
            .start_flow(
                &request.flow_type,
                request.initial_data,
                StartOptions {
                    correlation_id,
                    user_id,
                    triggered_by: Some(triggered_by),
                },
            )
            .await
    }

    async fn watch_children(&self, parent_flow_id: String, child_ids: Vec<String>) {
        self.0.arm_child_watcher(parent_flow_id, child_ids);
    }

    fn scheduler_exited(&self, flow_id: &str) {
        self.0.handles.lock().unwrap().remove(flow_id);
    }
}
