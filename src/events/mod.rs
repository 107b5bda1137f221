pub mod live;

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::engine::types::{
    FlowSnapshot, FlowStatus, PauseReason, StepInstance, StepResult, StepStatus,
};

/// Per-item outcome of a batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub flow_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status-change messages published on the bus. The `version` field is the
/// flow's snapshot version at the commit that produced the message — the
/// per-flow sequence number subscribers use to detect gaps and duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    FlowStatusChanged {
        flow_id: String,
        new_status: FlowStatus,
        version: u64,
        current_step_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_step_name: Option<String>,
        total_steps: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        pause_reason: Option<PauseReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
        created_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        completed_at: Option<DateTime<Utc>>,
    },
    StepStatusChanged {
        flow_id: String,
        step_name: String,
        step_status: StepStatus,
        flow_status: FlowStatus,
        version: u64,
        current_step_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_step_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_result: Option<StepResult>,
    },
    BatchResult {
        operation: String,
        success_count: usize,
        failure_count: usize,
        results: Vec<BatchItemResult>,
    },
}

impl EngineEvent {
    pub fn flow_status(flow: &FlowSnapshot) -> Self {
        EngineEvent::FlowStatusChanged {
            flow_id: flow.flow_id.clone(),
            new_status: flow.status,
            version: flow.version,
            current_step_index: flow.current_step_index,
            current_step_name: flow.current_step_name.clone(),
            total_steps: flow.total_steps,
            pause_reason: flow.pause_reason,
            last_error: flow.last_error.clone(),
            created_at: flow.created_at,
            started_at: flow.started_at,
            completed_at: flow.completed_at,
        }
    }

    pub fn step_status(flow: &FlowSnapshot, step: &StepInstance) -> Self {
        EngineEvent::StepStatusChanged {
            flow_id: flow.flow_id.clone(),
            step_name: step.name.clone(),
            step_status: step.status,
            flow_status: flow.status,
            version: flow.version,
            current_step_index: flow.current_step_index,
            current_step_name: flow.current_step_name.clone(),
            step_result: step.result.clone(),
        }
    }

    /// The flow this message belongs to; batch aggregates are admin-only.
    pub fn flow_id(&self) -> Option<&str> {
        match self {
            EngineEvent::FlowStatusChanged { flow_id, .. } => Some(flow_id),
            EngineEvent::StepStatusChanged { flow_id, .. } => Some(flow_id),
            EngineEvent::BatchResult { .. } => None,
        }
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            EngineEvent::FlowStatusChanged { version, .. } => Some(*version),
            EngineEvent::StepStatusChanged { version, .. } => Some(*version),
            EngineEvent::BatchResult { .. } => None,
        }
    }
}

/// In-process publish/subscribe of status changes: one admin channel for all
/// flows, plus per-flow channels created on first subscription.
///
/// Delivery is best-effort; durable truth stays in the store, and lagged
/// subscribers reconcile by fetching the current snapshot.
pub struct EventBus {
    admin: broadcast::Sender<EngineEvent>,
    flows: RwLock<HashMap<String, broadcast::Sender<EngineEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (admin, _) = broadcast::channel(capacity);
        Self {
            admin,
            flows: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        if let Some(flow_id) = event.flow_id() {
            let mut flows = self.flows.write().unwrap();
            // A send error means every subscriber is gone; drop the channel.
            let dead = match flows.get(flow_id) {
                Some(sender) => sender.send(event.clone()).is_err(),
                None => false,
            };
            if dead {
                flows.remove(flow_id);
            }
        }
        let _ = self.admin.send(event);
    }

    pub fn subscribe_admin(&self) -> broadcast::Receiver<EngineEvent> {
        self.admin.subscribe()
    }

    pub fn subscribe_flow(&self, flow_id: &str) -> broadcast::Receiver<EngineEvent> {
        let mut flows = self.flows.write().unwrap();
        flows
            .entry(flow_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}
