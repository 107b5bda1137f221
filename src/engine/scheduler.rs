use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::catalog::{StepCatalog, StepHandler, StepInput};
use crate::engine::commit::Persister;
use crate::engine::config::EngineConfig;
use crate::engine::errors::{EngineError, EngineResult};
use crate::engine::types::{
    FlowEventType, FlowSnapshot, FlowStatus, PauseReason, StepError, StepInstance, StepOutcome,
    StepResult, StepStatus, TriggerRequest, TriggeredBy, TriggeredFlowRef,
};
use crate::events::EngineEvent;
use crate::storage::StoreError;

/// Externally requested transitions. Applied at step boundaries only —
/// a running step's business logic is never interrupted.
#[derive(Debug)]
pub enum Control {
    Pause { message: Option<String> },
    Cancel { reason: String },
}

/// Handle to a live scheduler task.
pub struct SchedulerHandle {
    control_tx: mpsc::UnboundedSender<Control>,
    cancel_tx: watch::Sender<bool>,
}

impl SchedulerHandle {
    pub fn request_pause(&self, message: Option<String>) -> bool {
        self.control_tx.send(Control::Pause { message }).is_ok()
    }

    /// Signals the running step immediately; the flow transitions at the
    /// next boundary.
    pub fn request_cancel(&self, reason: String) -> bool {
        let _ = self.cancel_tx.send(true);
        self.control_tx.send(Control::Cancel { reason }).is_ok()
    }
}

/// What the scheduler asks of its host (the engine service).
#[async_trait]
pub trait SchedulerHost: Send + Sync {
    /// Create and start a child flow; returns its id.
    async fn spawn_child(
        &self,
        request: TriggerRequest,
        triggered_by: TriggeredBy,
        correlation_id: Option<String>,
        user_id: Option<String>,
    ) -> EngineResult<String>;

    /// Resume `parent_flow_id` once every listed child reaches a terminal
    /// status. One-shot.
    async fn watch_children(&self, parent_flow_id: String, child_ids: Vec<String>);

    /// The scheduler task for `flow_id` is gone; drop its handle.
    fn scheduler_exited(&self, flow_id: &str);
}

type OutcomeMessage = (String, Result<StepOutcome, StepError>);

/// Single authority for one flow instance. Runs as a task that drives the
/// flow to its next pause or terminal commit, then exits; resume, retry and
/// restore respawn it from the snapshot.
pub struct Scheduler {
    flow: FlowSnapshot,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    persister: Arc<Persister>,
    host: Arc<dyn SchedulerHost>,
    config: Arc<EngineConfig>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    outcome_tx: mpsc::UnboundedSender<OutcomeMessage>,
    outcome_rx: mpsc::UnboundedReceiver<OutcomeMessage>,
    cancel_tx: watch::Sender<bool>,
    in_flight: HashSet<String>,
    pending_pause: Option<Option<String>>,
    pending_cancel: Option<String>,
    /// Set when a critical failure or invariant violation is recorded;
    /// stops new launches so the flow can fail at the boundary.
    halt: bool,
    /// Child ids to watch once this task has exited. Arming after exit
    /// keeps the watcher's resume from racing the live-handle teardown.
    deferred_watch: Option<Vec<String>>,
}

impl Scheduler {
    pub fn new(
        flow: FlowSnapshot,
        catalog: &StepCatalog,
        persister: Arc<Persister>,
        host: Arc<dyn SchedulerHost>,
        config: Arc<EngineConfig>,
    ) -> EngineResult<(Self, SchedulerHandle)> {
        let mut handlers = HashMap::new();
        for step in &flow.steps {
            let handler = catalog.handler(&flow.flow_type, &step.name)?;
            handlers.insert(step.name.clone(), handler);
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (cancel_tx, _) = watch::channel(false);

        let handle = SchedulerHandle {
            control_tx,
            cancel_tx: cancel_tx.clone(),
        };

        Ok((
            Self {
                flow,
                handlers,
                persister,
                host,
                config,
                control_rx,
                outcome_tx,
                outcome_rx,
                cancel_tx,
                in_flight: HashSet::new(),
                pending_pause: None,
                pending_cancel: None,
                halt: false,
                deferred_watch: None,
            },
            handle,
        ))
    }

    /// Spawn the drive loop as a task.
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let flow_id = self.flow.flow_id.clone();
        if let Err(e) = self.drive().await {
            error!(flow_id = %flow_id, error = %e, "Scheduler fault");
            self.fail_on_engine_error(e).await;
        }
        self.host.scheduler_exited(&flow_id);
        if let Some(children) = self.deferred_watch.take() {
            self.host.watch_children(flow_id, children).await;
        }
    }

    async fn drive(&mut self) -> EngineResult<()> {
        match self.flow.status {
            FlowStatus::Initializing => {
                self.transition_status(FlowStatus::Ready, None).await?;
                self.transition_status(FlowStatus::Running, Some(FlowEventType::FlowStarted))
                    .await?;
            }
            FlowStatus::Ready => {
                self.transition_status(FlowStatus::Running, Some(FlowEventType::FlowStarted))
                    .await?;
            }
            FlowStatus::Paused => self.apply_resume().await?,
            FlowStatus::Running => {}
            status => {
                return Err(EngineError::InvalidTransition {
                    op: "drive",
                    status,
                });
            }
        }

        loop {
            self.drain_controls();

            if self.pending_cancel.is_some() {
                let _ = self.cancel_tx.send(true);
            }

            if self.in_flight.is_empty() {
                if let Some(reason) = self.pending_cancel.take() {
                    return self.finish_cancelled(reason).await;
                }
                if let Some(message) = self.pending_pause.take() {
                    return self.finish_paused(PauseReason::Manual, message).await;
                }
            }

            self.check_awaiting_children().await?;

            if !self.halt && self.pending_cancel.is_none() && self.pending_pause.is_none() {
                self.launch_runnable().await?;
            }

            if self.in_flight.is_empty() && self.try_finish().await? {
                return Ok(());
            }

            tokio::select! {
                Some(control) = self.control_rx.recv() => self.stash_control(control),
                Some((name, result)) = self.outcome_rx.recv() => {
                    self.in_flight.remove(&name);
                    self.apply_outcome(&name, result).await?;
                }
            }
        }
    }

    // ----- control handling -----

    fn drain_controls(&mut self) {
        while let Ok(control) = self.control_rx.try_recv() {
            self.stash_control(control);
        }
    }

    fn stash_control(&mut self, control: Control) {
        match control {
            Control::Pause { message } => {
                if self.pending_cancel.is_none() {
                    self.pending_pause = Some(message);
                }
            }
            Control::Cancel { reason } => {
                self.pending_pause = None;
                self.pending_cancel = Some(reason);
            }
        }
    }

    // ----- lifecycle transitions -----

    async fn transition_status(
        &mut self,
        status: FlowStatus,
        event: Option<FlowEventType>,
    ) -> EngineResult<()> {
        self.flow.status = status;
        if status == FlowStatus::Running && self.flow.started_at.is_none() {
            self.flow.started_at = Some(Utc::now());
        }
        if let Some(event_type) = event {
            let description = format!("flow {}", status);
            self.flow
                .push_event(event_type, description, self.config.event_tail_limit);
        }
        self.persist(|flow| vec![EngineEvent::flow_status(flow)])
            .await
    }

    /// Entry path when respawned on a paused flow: back to `Running`, with
    /// retry-paused steps reset to `Pending`.
    async fn apply_resume(&mut self) -> EngineResult<()> {
        self.flow.status = FlowStatus::Running;
        self.flow.pause_reason = None;
        self.flow.pause_message = None;
        self.flow.paused_at = None;

        for step in &mut self.flow.steps {
            if step.status == StepStatus::Paused {
                step.reset_for_retry();
            }
        }

        self.flow.push_event(
            FlowEventType::FlowResumed,
            "flow resumed",
            self.config.event_tail_limit,
        );
        info!(flow_id = %self.flow.flow_id, "Flow resumed");
        self.persist(|flow| vec![EngineEvent::flow_status(flow)])
            .await
    }

    // ----- runnable set -----

    fn terminal_count(&self) -> usize {
        self.flow
            .steps
            .iter()
            .filter(|s| s.status.is_terminal())
            .count()
    }

    fn branch_gate_open(&self, step: &StepInstance) -> bool {
        match &step.branch_of {
            None => true,
            Some(owner) => self
                .flow
                .step(&owner.step)
                .is_some_and(|o| o.selected_branch.as_deref() == Some(owner.branch.as_str())),
        }
    }

    fn dependencies_satisfied(&self, step: &StepInstance) -> bool {
        step.meta.step_dependencies.iter().all(|dep| {
            self.flow
                .step(dep)
                .is_some_and(|d| d.status.satisfies_dependency())
        })
    }

    fn data_dependencies_satisfied(&self, step: &StepInstance) -> bool {
        step.meta
            .data_dependencies
            .iter()
            .all(|(key, kind)| self.flow.data.kind_of(key) == Some(*kind))
    }

    fn concurrency_allows(&self, step: &StepInstance) -> bool {
        let in_progress: Vec<&StepInstance> = self
            .flow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::InProgress)
            .collect();

        if !step.meta.can_run_in_parallel {
            return in_progress.is_empty();
        }
        in_progress.iter().all(|other| {
            other.meta.can_run_in_parallel
                && (step.meta.resource_group.is_none()
                    || other.meta.resource_group != step.meta.resource_group)
        })
    }

    fn next_runnable(&self) -> Option<String> {
        if self.in_flight.len() >= self.config.max_concurrent_steps {
            return None;
        }
        // A step holding out for its child flows keeps the flow at a
        // boundary; nothing new launches until it finalizes.
        if self.flow.steps.iter().any(|s| s.awaiting_children()) {
            return None;
        }

        let mut candidates: Vec<&StepInstance> = self
            .flow
            .steps
            .iter()
            .filter(|s| {
                s.status == StepStatus::Pending
                    && self.branch_gate_open(s)
                    && self.dependencies_satisfied(s)
                    && self.data_dependencies_satisfied(s)
                    && self.concurrency_allows(s)
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.meta
                .priority
                .cmp(&a.meta.priority)
                .then(a.index.cmp(&b.index))
        });
        candidates.first().map(|s| s.name.clone())
    }

    async fn launch_runnable(&mut self) -> EngineResult<()> {
        while let Some(name) = self.next_runnable() {
            self.launch_step(&name).await?;
        }
        Ok(())
    }

    async fn launch_step(&mut self, name: &str) -> EngineResult<()> {
        let (attempt, timeout_s, handler) = {
            let step = self
                .flow
                .step_mut(name)
                .ok_or_else(|| EngineError::Internal(format!("unknown step '{}'", name)))?;
            step.status = StepStatus::InProgress;
            step.attempts += 1;
            step.started_at = Some(Utc::now());
            step.finished_at = None;
            step.resume_at = None;
            let attempt = step.attempts;
            let timeout_s = step.meta.timeout_s;
            (attempt, timeout_s, self.handlers[name].clone())
        };

        self.flow.current_step_name = Some(name.to_string());
        self.flow.push_event(
            FlowEventType::StepStarted,
            format!("step '{}' started (attempt {})", name, attempt),
            self.config.event_tail_limit,
        );

        let step_name = name.to_string();
        self.persist(move |flow| {
            let step = flow.step(&step_name).expect("step exists");
            vec![EngineEvent::step_status(flow, step)]
        })
        .await?;

        info!(
            flow_id = %self.flow.flow_id,
            step = %name,
            attempt = attempt,
            "Running step"
        );

        let input = StepInput {
            flow_id: self.flow.flow_id.clone(),
            flow_type: self.flow.flow_type.clone(),
            attempt,
            data: self.flow.data.view(),
            cancel: self.cancel_tx.subscribe(),
        };

        let tx = self.outcome_tx.clone();
        let name = name.to_string();
        self.in_flight.insert(name.clone());

        tokio::spawn(async move {
            let execution = AssertUnwindSafe(handler.execute(input)).catch_unwind();
            let result = match timeout_s {
                Some(t) => match tokio::time::timeout(Duration::from_secs_f64(t), execution).await {
                    Ok(caught) => flatten_execution(caught),
                    Err(_) => Err(StepError::timeout(format!(
                        "step timed out after {}s",
                        t
                    ))),
                },
                None => flatten_execution(execution.await),
            };
            let _ = tx.send((name, result));
        });

        Ok(())
    }

    // ----- outcome application -----

    async fn apply_outcome(
        &mut self,
        name: &str,
        result: Result<StepOutcome, StepError>,
    ) -> EngineResult<()> {
        match result {
            Ok(outcome) if outcome.is_success => self.record_success(name, outcome).await,
            Ok(outcome) => {
                let error = outcome.error.unwrap_or_else(|| {
                    StepError::business(if outcome.message.is_empty() {
                        "step reported failure".to_string()
                    } else {
                        outcome.message
                    })
                });
                self.record_failure(name, error).await
            }
            Err(error) => self.record_failure(name, error).await,
        }
    }

    async fn record_success(&mut self, name: &str, outcome: StepOutcome) -> EngineResult<()> {
        // Spawn requested child flows first; their ids become part of this
        // step's durable record. Skipped when the flow is being cancelled so
        // no sub-flow leaks past the cancel.
        let mut triggered = Vec::new();
        if self.pending_cancel.is_none() {
            for request in &outcome.triggered_flows {
                let triggered_by = TriggeredBy {
                    flow_id: self.flow.flow_id.clone(),
                    triggered_by_step: name.to_string(),
                    flow_type: self.flow.flow_type.clone(),
                };
                let child_id = self
                    .host
                    .spawn_child(
                        request.clone(),
                        triggered_by,
                        self.flow.correlation_id.clone(),
                        self.flow.user_id.clone(),
                    )
                    .await;
                match child_id {
                    Ok(child_id) => triggered.push(TriggeredFlowRef {
                        flow_id: Some(child_id),
                        flow_type: request.flow_type.clone(),
                        status: None,
                        triggered_by_step: name.to_string(),
                        created_at: Some(Utc::now()),
                    }),
                    Err(e) => {
                        return self
                            .record_failure(
                                name,
                                StepError::internal(format!(
                                    "failed to trigger child flow '{}': {}",
                                    request.flow_type, e
                                )),
                            )
                            .await;
                    }
                }
            }
        }

        let awaiting = {
            let step = self
                .flow
                .step_mut(name)
                .ok_or_else(|| EngineError::Internal(format!("unknown step '{}'", name)))?;
            step.finished_at = Some(Utc::now());
            step.sub_steps = outcome.sub_steps;
            step.branch_hint = outcome.branch_hint;
            step.triggered_flows.extend(triggered.clone());
            step.result = Some(StepResult {
                is_success: true,
                message: outcome.message,
                data: outcome.data,
            });
            step.error = None;
            step.awaiting_children()
        };

        for child in &triggered {
            self.flow.push_event(
                FlowEventType::ChildFlowTriggered,
                format!(
                    "step '{}' triggered {} flow {}",
                    name,
                    child.flow_type,
                    child.flow_id.as_deref().unwrap_or("?")
                ),
                self.config.event_tail_limit,
            );
        }

        if !awaiting {
            self.finalize_completion(name);
        }

        let step_name = name.to_string();
        self.persist(move |flow| {
            let step = flow.step(&step_name).expect("step exists");
            vec![EngineEvent::step_status(flow, step)]
        })
        .await
    }

    /// Apply a successful step's deferred writes, mark it completed, and
    /// run branch selection. Mutates in memory; the caller commits.
    fn finalize_completion(&mut self, name: &str) {
        let (writes, outputs) = {
            let step = self.flow.step(name).expect("step exists");
            let writes = step
                .result
                .as_ref()
                .map(|r| r.data.clone())
                .unwrap_or_default();
            (writes, step.meta.outputs.clone())
        };

        // Outputs declared by other steps still in progress.
        let running_outputs: BTreeMap<String, String> = self
            .flow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::InProgress && s.name != name)
            .flat_map(|s| {
                s.meta
                    .outputs
                    .iter()
                    .map(|key| (key.clone(), s.name.clone()))
            })
            .collect();

        if let Err(violation) =
            self.flow
                .data
                .merge_step_writes(name, &writes, &outputs, &running_outputs)
        {
            let message = violation.to_string();
            let step = self.flow.step_mut(name).expect("step exists");
            step.status = StepStatus::Failed;
            step.error = Some(StepError::internal(&message));
            self.flow.last_error = Some(message.clone());
            self.halt = true;
            self.flow.push_event(
                FlowEventType::EngineFault,
                message,
                self.config.event_tail_limit,
            );
            return;
        }

        let step = self.flow.step_mut(name).expect("step exists");
        step.status = StepStatus::Completed;
        let message = step
            .result
            .as_ref()
            .map(|r| r.message.clone())
            .unwrap_or_default();

        self.flow.current_step_name = Some(name.to_string());
        self.flow.current_step_index = self.terminal_count();
        self.flow.push_event(
            FlowEventType::StepCompleted,
            if message.is_empty() {
                format!("step '{}' completed", name)
            } else {
                format!("step '{}' completed: {}", name, message)
            },
            self.config.event_tail_limit,
        );

        self.select_branch(name);
        self.flow.current_step_index = self.terminal_count();
    }

    /// Exactly one branch is chosen on completion: a hint naming a declared
    /// branch wins, else the first satisfied conditional, else the default.
    /// With branches declared and nothing chosen, the step fails.
    fn select_branch(&mut self, name: &str) {
        let step = self.flow.step(name).expect("step exists");
        if step.meta.branches.is_empty() {
            return;
        }
        let branches = step.meta.branches.clone();
        let hint = step.branch_hint.clone();

        let chosen = hint
            .filter(|h| branches.iter().any(|b| &b.name == h))
            .or_else(|| {
                branches
                    .iter()
                    .find(|b| {
                        b.condition
                            .as_deref()
                            .is_some_and(|c| crate::catalog::condition::evaluate(c, &self.flow.data))
                    })
                    .map(|b| b.name.clone())
            })
            .or_else(|| {
                branches
                    .iter()
                    .find(|b| b.is_default)
                    .map(|b| b.name.clone())
            });

        let Some(chosen) = chosen else {
            let message = format!("branch selection failed on step '{}': no branch matched and no default is declared", name);
            let step = self.flow.step_mut(name).expect("step exists");
            step.status = StepStatus::Failed;
            step.error = Some(StepError::business(&message));
            self.flow.last_error = Some(message.clone());
            self.halt = true;
            self.flow.push_event(
                FlowEventType::StepFailed,
                message,
                self.config.event_tail_limit,
            );
            return;
        };

        {
            let step = self.flow.step_mut(name).expect("step exists");
            step.selected_branch = Some(chosen.clone());
        }
        self.flow.push_event(
            FlowEventType::BranchSelected,
            format!("step '{}' selected branch '{}'", name, chosen),
            self.config.event_tail_limit,
        );

        // The unchosen branches' steps are dead paths now; skip them and
        // anything nested beneath them.
        let mut dead: Vec<String> = Vec::new();
        for branch in &branches {
            if branch.name != chosen {
                dead.extend(branch.steps.iter().cloned());
            }
        }
        self.skip_dead_paths(dead);
    }

    fn skip_dead_paths(&mut self, mut queue: Vec<String>) {
        while let Some(dead_name) = queue.pop() {
            let Some(step) = self.flow.step_mut(&dead_name) else {
                continue;
            };
            if step.status != StepStatus::Pending {
                continue;
            }
            step.status = StepStatus::Skipped;
            let nested: Vec<String> = step
                .meta
                .branches
                .iter()
                .flat_map(|b| b.steps.iter().cloned())
                .collect();
            self.flow.push_event(
                FlowEventType::StepSkipped,
                format!("step '{}' skipped (branch not selected)", dead_name),
                self.config.event_tail_limit,
            );
            queue.extend(nested);
        }
    }

    async fn record_failure(&mut self, name: &str, error: StepError) -> EngineResult<()> {
        let (attempts, max_retries, retry_delay_s, is_critical) = {
            let step = self
                .flow
                .step_mut(name)
                .ok_or_else(|| EngineError::Internal(format!("unknown step '{}'", name)))?;
            step.finished_at = Some(Utc::now());
            step.error = Some(error.clone());
            step.result = Some(StepResult {
                is_success: false,
                message: error.message.clone(),
                data: Default::default(),
            });
            (
                step.attempts,
                step.meta.max_retries,
                step.meta.retry_delay_s,
                step.meta.is_critical,
            )
        };

        let retryable =
            error.kind.is_retryable() && attempts <= max_retries && self.pending_cancel.is_none();

        if retryable {
            let resume_at = Utc::now()
                + chrono::Duration::from_std(Duration::from_secs_f64(retry_delay_s))
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
            let step = self.flow.step_mut(name).expect("step exists");
            step.status = StepStatus::Paused;
            step.resume_at = Some(resume_at);
            warn!(
                flow_id = %self.flow.flow_id,
                step = %name,
                attempt = attempts,
                error = %error.message,
                "Step failed — retry scheduled"
            );
            self.flow.push_event(
                FlowEventType::StepRetryScheduled,
                format!(
                    "step '{}' failed (attempt {}), retry in {}s: {}",
                    name, attempts, retry_delay_s, error.message
                ),
                self.config.event_tail_limit,
            );
        } else if !is_critical {
            let step = self.flow.step_mut(name).expect("step exists");
            step.status = StepStatus::Skipped;
            warn!(
                flow_id = %self.flow.flow_id,
                step = %name,
                error = %error.message,
                "Non-critical step failed — skipping"
            );
            self.flow.push_event(
                FlowEventType::StepSkipped,
                format!(
                    "step '{}' failed permanently and is not critical: {}",
                    name, error.message
                ),
                self.config.event_tail_limit,
            );
            self.flow.current_step_index = self.terminal_count();
        } else {
            let step = self.flow.step_mut(name).expect("step exists");
            step.status = StepStatus::Failed;
            self.flow.last_error = Some(error.message.clone());
            self.halt = true;
            error!(
                flow_id = %self.flow.flow_id,
                step = %name,
                attempts = attempts,
                error = %error.message,
                "Step failed"
            );
            self.flow.push_event(
                FlowEventType::StepFailed,
                format!(
                    "step '{}' failed after {} attempt(s): {}",
                    name, attempts, error.message
                ),
                self.config.event_tail_limit,
            );
            self.flow.current_step_index = self.terminal_count();
        }

        let step_name = name.to_string();
        self.persist(move |flow| {
            let step = flow.step(&step_name).expect("step exists");
            vec![EngineEvent::step_status(flow, step)]
        })
        .await
    }

    // ----- child flow waits -----

    /// Refresh the child statuses of steps held open by `await_triggered`;
    /// finalize the ones whose children have all reached a terminal status.
    async fn check_awaiting_children(&mut self) -> EngineResult<()> {
        let awaiting: Vec<String> = self
            .flow
            .steps
            .iter()
            .filter(|s| s.awaiting_children())
            .map(|s| s.name.clone())
            .collect();

        for name in awaiting {
            let refs = self
                .flow
                .step(&name)
                .map(|s| s.triggered_flows.clone())
                .unwrap_or_default();

            let mut statuses = Vec::with_capacity(refs.len());
            for child in &refs {
                let status = match &child.flow_id {
                    Some(id) => self
                        .persister
                        .store()
                        .load(id)
                        .await?
                        .map(|snapshot| snapshot.status),
                    None => None,
                };
                statuses.push(status);
            }

            {
                let step = self.flow.step_mut(&name).expect("step exists");
                for (child, status) in step.triggered_flows.iter_mut().zip(&statuses) {
                    child.status = *status;
                }
            }

            let all_terminal = statuses
                .iter()
                .all(|s| s.is_some_and(|status| status.is_terminal()));
            if all_terminal {
                info!(flow_id = %self.flow.flow_id, step = %name, "Child flows finished — resuming step");
                self.finalize_completion(&name);
                let step_name = name.clone();
                self.persist(move |flow| {
                    let step = flow.step(&step_name).expect("step exists");
                    vec![EngineEvent::step_status(flow, step)]
                })
                .await?;
            }
        }
        Ok(())
    }

    // ----- boundary decisions -----

    /// Called with nothing in flight and nothing launchable: close the flow
    /// into a terminal or paused state. Returns false only when a launch
    /// became possible again (never, in practice, by construction).
    async fn try_finish(&mut self) -> EngineResult<bool> {
        if self.next_runnable().is_some() {
            return Ok(false);
        }

        if self.halt || self.flow.steps.iter().any(|s| s.status == StepStatus::Failed) {
            self.finish_failed().await?;
            return Ok(true);
        }

        let awaiting: Vec<String> = self
            .flow
            .steps
            .iter()
            .filter(|s| s.awaiting_children())
            .flat_map(|s| s.triggered_flows.iter().filter_map(|c| c.flow_id.clone()))
            .collect();
        if !awaiting.is_empty() {
            self.finish_paused(PauseReason::AwaitingChildFlow, None).await?;
            self.deferred_watch = Some(awaiting);
            return Ok(true);
        }

        if let Some(step) = self
            .flow
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Paused)
        {
            let message = format!("awaiting retry of step '{}'", step.name);
            self.finish_paused(PauseReason::AwaitingRetry, Some(message))
                .await?;
            return Ok(true);
        }

        if self.flow.steps.iter().all(|s| s.status.is_terminal()) {
            self.finish_completed().await?;
            return Ok(true);
        }

        // Pending steps remain but none can ever run: unsatisfiable data
        // dependencies or a branch path that was never selected.
        let stuck: Vec<&str> = self
            .flow
            .steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.name.as_str())
            .collect();
        let message = format!("unsatisfiable steps: {}", stuck.join(", "));
        self.flow.last_error = Some(message.clone());
        self.flow.push_event(
            FlowEventType::EngineFault,
            message,
            self.config.event_tail_limit,
        );
        self.finish_failed().await?;
        Ok(true)
    }

    async fn finish_completed(&mut self) -> EngineResult<()> {
        self.flow.status = FlowStatus::Completed;
        self.flow.completed_at = Some(Utc::now());
        self.flow.current_step_index = self.terminal_count();
        self.flow.push_event(
            FlowEventType::FlowCompleted,
            "flow completed",
            self.config.event_tail_limit,
        );
        info!(flow_id = %self.flow.flow_id, "Flow completed");
        self.persist(|flow| vec![EngineEvent::flow_status(flow)])
            .await
    }

    async fn finish_failed(&mut self) -> EngineResult<()> {
        // Terminal flows carry no non-terminal steps; anything unreachable
        // is closed out as skipped.
        self.close_out_steps(StepStatus::Skipped);
        self.flow.status = FlowStatus::Failed;
        self.flow.completed_at = Some(Utc::now());
        self.flow.current_step_index = self.terminal_count();
        self.flow.push_event(
            FlowEventType::FlowFailed,
            self.flow
                .last_error
                .clone()
                .unwrap_or_else(|| "flow failed".to_string()),
            self.config.event_tail_limit,
        );
        error!(
            flow_id = %self.flow.flow_id,
            error = %self.flow.last_error.as_deref().unwrap_or("?"),
            "Flow failed"
        );
        self.persist(|flow| vec![EngineEvent::flow_status(flow)])
            .await
    }

    async fn finish_cancelled(&mut self, reason: String) -> EngineResult<()> {
        self.close_out_steps(StepStatus::Skipped);
        self.flow.status = FlowStatus::Cancelled;
        self.flow.completed_at = Some(Utc::now());
        self.flow.current_step_index = self.terminal_count();
        self.flow.push_event(
            FlowEventType::FlowCancelled,
            format!("flow cancelled: {}", reason),
            self.config.event_tail_limit,
        );
        info!(flow_id = %self.flow.flow_id, reason = %reason, "Flow cancelled");
        self.persist(|flow| vec![EngineEvent::flow_status(flow)])
            .await
    }

    async fn finish_paused(
        &mut self,
        reason: PauseReason,
        message: Option<String>,
    ) -> EngineResult<()> {
        self.flow.status = FlowStatus::Paused;
        self.flow.pause_reason = Some(reason);
        self.flow.pause_message = message;
        self.flow.paused_at = Some(Utc::now());
        self.flow.push_event(
            FlowEventType::FlowPaused,
            format!(
                "flow paused ({}){}",
                reason,
                self.flow
                    .pause_message
                    .as_deref()
                    .map(|m| format!(": {}", m))
                    .unwrap_or_default()
            ),
            self.config.event_tail_limit,
        );
        info!(flow_id = %self.flow.flow_id, reason = %reason, "Flow paused");
        self.persist(|flow| vec![EngineEvent::flow_status(flow)])
            .await
    }

    /// Close every non-terminal step so a terminal flow holds no live steps.
    fn close_out_steps(&mut self, terminal: StepStatus) {
        for step in &mut self.flow.steps {
            if !step.status.is_terminal() {
                step.status = terminal;
                step.resume_at = None;
                step.closed_out = true;
            }
        }
    }

    // ----- persistence -----

    /// Commit through the persister. Losing the CAS race means another
    /// scheduler owns the flow now: reload its state and re-evaluate.
    async fn persist<F>(&mut self, build: F) -> EngineResult<()>
    where
        F: FnOnce(&FlowSnapshot) -> Vec<EngineEvent>,
    {
        match self.persister.commit(&mut self.flow, build).await {
            Ok(()) => Ok(()),
            Err(StoreError::VersionConflict { .. }) => {
                warn!(
                    flow_id = %self.flow.flow_id,
                    "Lost snapshot CAS — reloading"
                );
                match self.persister.store().load(&self.flow.flow_id).await? {
                    Some(fresh) => {
                        self.flow = fresh;
                        Ok(())
                    }
                    None => Err(EngineError::NotFound(self.flow.flow_id.clone())),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Last-resort path for scheduler-internal faults: no partial state may
    /// remain observable, so the flow is failed with the fault recorded.
    async fn fail_on_engine_error(&mut self, e: EngineError) {
        if self.flow.status.is_terminal() {
            return;
        }
        for step in &mut self.flow.steps {
            if step.status == StepStatus::InProgress {
                step.status = StepStatus::Failed;
                step.error = Some(StepError::internal(e.to_string()));
            } else if !step.status.is_terminal() {
                step.status = StepStatus::Skipped;
            }
        }
        self.flow.status = FlowStatus::Failed;
        self.flow.completed_at = Some(Utc::now());
        self.flow.last_error = Some(e.to_string());
        self.flow.push_event(
            FlowEventType::EngineFault,
            e.to_string(),
            self.config.event_tail_limit,
        );
        if let Err(persist_err) = self
            .persister
            .commit(&mut self.flow, |flow| vec![EngineEvent::flow_status(flow)])
            .await
        {
            error!(
                flow_id = %self.flow.flow_id,
                error = %persist_err,
                "Failed to persist engine fault"
            );
        }
    }
}

fn flatten_execution(
    caught: Result<anyhow::Result<StepOutcome>, Box<dyn std::any::Any + Send>>,
) -> Result<StepOutcome, StepError> {
    match caught {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => {
            Err(StepError::transient(format!("{:#}", e)).with_stack_trace(format!("{:?}", e)))
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "step panicked".to_string());
            Err(StepError::internal(format!("step panicked: {}", message)))
        }
    }
}
