use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::engine::errors::EngineResult;
use crate::engine::service::FlowEngine;
use crate::engine::types::{
    ErrorKind, FlowEventType, FlowSnapshot, FlowStatus, PauseReason, StepError, StepStatus,
};
use crate::events::EngineEvent;

/// What a restore pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub scanned: usize,
    /// Schedulers respawned immediately.
    pub resumed: usize,
    /// Flows left paused for the retry sweep or an operator.
    pub pending_retry: usize,
    /// Child-flow watchers re-armed.
    pub awaiting_children: usize,
    /// Flows failed by restore (catalog drift, interrupted critical steps).
    pub failed: usize,
}

impl FlowEngine {
    /// Rehydrate every non-terminal flow from the durable store.
    ///
    /// Run once at process start. Steps that were in progress when the
    /// process died revert to pending when idempotent, otherwise they fail
    /// with `InterruptedNonIdempotent` and the retry policy applies. Flows
    /// whose step names no longer resolve in the catalog are failed with a
    /// catalog drift error.
    pub async fn restore(&self) -> EngineResult<RestoreReport> {
        let inner = self.inner();
        let flows = inner.store_arc().list_non_terminal().await?;
        let mut report = RestoreReport::default();

        for mut flow in flows {
            report.scanned += 1;
            let flow_id = flow.flow_id.clone();

            if let Some(missing) = self.catalog_drift(&flow) {
                let message = format!("catalog drift: {}", missing);
                warn!(flow_id = %flow_id, error = %message, "Cannot restore flow");
                self.fail_unrestorable(&mut flow, message).await?;
                report.failed += 1;
                continue;
            }

            let (interrupted_critical, reverted) = self.revert_in_flight(&mut flow);
            if interrupted_critical {
                let message = flow
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "interrupted non-idempotent step".to_string());
                self.fail_unrestorable(&mut flow, message).await?;
                report.failed += 1;
                continue;
            }

            match flow.status {
                FlowStatus::Initializing | FlowStatus::Ready | FlowStatus::Running => {
                    flow.push_event(
                        FlowEventType::FlowResumed,
                        "flow restored after restart",
                        self.config().event_tail_limit,
                    );
                    inner
                        .persister_arc()
                        .commit(&mut flow, |f| vec![EngineEvent::flow_status(f)])
                        .await?;
                    info!(flow_id = %flow_id, "Restored flow — resuming");
                    inner.spawn_scheduler(flow)?;
                    report.resumed += 1;
                }
                FlowStatus::Paused => {
                    // Reversions must be durable even when the flow stays
                    // paused (a running flow can land here when an
                    // interrupted step got its retry scheduled).
                    if reverted {
                        inner
                            .persister_arc()
                            .commit(&mut flow, |f| vec![EngineEvent::flow_status(f)])
                            .await?;
                    }
                    match flow.pause_reason {
                        Some(PauseReason::AwaitingChildFlow) => {
                            let children: Vec<String> = flow
                                .steps
                                .iter()
                                .filter(|s| s.awaiting_children())
                                .flat_map(|s| {
                                    s.triggered_flows.iter().filter_map(|c| c.flow_id.clone())
                                })
                                .collect();
                            info!(
                                flow_id = %flow_id,
                                children = children.len(),
                                "Restored flow — re-arming child watcher"
                            );
                            inner.arm_child_watcher(flow_id, children);
                            report.awaiting_children += 1;
                        }
                        _ => {
                            // The retry sweep (or an operator) re-enters these.
                            report.pending_retry += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        info!(
            scanned = report.scanned,
            resumed = report.resumed,
            pending_retry = report.pending_retry,
            awaiting_children = report.awaiting_children,
            failed = report.failed,
            "Restore pass finished"
        );
        Ok(report)
    }

    /// First step name (or the flow type itself) that no longer resolves.
    fn catalog_drift(&self, flow: &FlowSnapshot) -> Option<String> {
        match self.catalog().resolve(&flow.flow_type) {
            Err(_) => Some(flow.flow_type.clone()),
            Ok(handlers) => {
                let names: HashSet<String> =
                    handlers.iter().map(|h| h.describe().name).collect();
                flow.steps
                    .iter()
                    .find(|s| !names.contains(&s.name))
                    .map(|s| s.name.clone())
            }
        }
    }

    /// Revert steps that were mid-execution when the process died. Returns
    /// `(critical_failure, reverted_any)`: the first is true when a critical
    /// step cannot be safely re-run.
    fn revert_in_flight(&self, flow: &mut FlowSnapshot) -> (bool, bool) {
        let mut critical_failure = false;
        let tail = self.config().event_tail_limit;

        let names: Vec<String> = flow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::InProgress && !s.awaiting_children())
            .map(|s| s.name.clone())
            .collect();
        let reverted_any = !names.is_empty();

        for name in names {
            let step = flow.step_mut(&name).expect("step exists");
            if step.meta.is_idempotent {
                step.status = StepStatus::Pending;
                step.started_at = None;
                flow.push_event(
                    FlowEventType::StepRetryScheduled,
                    format!("step '{}' was in flight at shutdown; re-running (idempotent)", name),
                    tail,
                );
                continue;
            }

            let error = StepError::new(
                ErrorKind::InterruptedNonIdempotent,
                format!(
                    "step '{}' was interrupted mid-execution and does not declare idempotency",
                    name
                ),
            );
            step.error = Some(error.clone());
            step.finished_at = Some(Utc::now());

            if step.attempts <= step.meta.max_retries {
                let delay = Duration::from_secs_f64(step.meta.retry_delay_s);
                step.status = StepStatus::Paused;
                step.resume_at = Some(
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(1)),
                );
                flow.status = FlowStatus::Paused;
                flow.pause_reason = Some(PauseReason::AwaitingRetry);
                flow.paused_at = Some(Utc::now());
                flow.push_event(
                    FlowEventType::StepRetryScheduled,
                    format!("step '{}' interrupted; retry scheduled", name),
                    tail,
                );
            } else if !step.meta.is_critical {
                step.status = StepStatus::Skipped;
                flow.push_event(
                    FlowEventType::StepSkipped,
                    format!("step '{}' interrupted; skipped (not critical)", name),
                    tail,
                );
            } else {
                step.status = StepStatus::Failed;
                flow.last_error = Some(error.message.clone());
                critical_failure = true;
            }
        }
        (critical_failure, reverted_any)
    }

    async fn fail_unrestorable(
        &self,
        flow: &mut FlowSnapshot,
        message: String,
    ) -> EngineResult<()> {
        for step in &mut flow.steps {
            if step.status == StepStatus::InProgress {
                step.status = StepStatus::Failed;
            } else if !step.status.is_terminal() {
                step.status = StepStatus::Skipped;
                step.closed_out = true;
            }
        }
        flow.status = FlowStatus::Failed;
        flow.completed_at = Some(Utc::now());
        flow.last_error = Some(message.clone());
        flow.push_event(
            FlowEventType::EngineFault,
            message,
            self.config().event_tail_limit,
        );
        self.inner()
            .persister_arc()
            .commit(flow, |f| vec![EngineEvent::flow_status(f)])
            .await?;
        Ok(())
    }
}
