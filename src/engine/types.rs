use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{DataContext, DataMap, ValueKind};

/// Bumped on breaking snapshot format changes.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Status of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Initializing,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }

    pub const ALL: [FlowStatus; 7] = [
        FlowStatus::Initializing,
        FlowStatus::Ready,
        FlowStatus::Running,
        FlowStatus::Paused,
        FlowStatus::Completed,
        FlowStatus::Failed,
        FlowStatus::Cancelled,
    ];
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowStatus::Initializing => write!(f, "initializing"),
            FlowStatus::Ready => write!(f, "ready"),
            FlowStatus::Running => write!(f, "running"),
            FlowStatus::Paused => write!(f, "paused"),
            FlowStatus::Completed => write!(f, "completed"),
            FlowStatus::Failed => write!(f, "failed"),
            FlowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "initializing" => Ok(FlowStatus::Initializing),
            "ready" => Ok(FlowStatus::Ready),
            "running" => Ok(FlowStatus::Running),
            "paused" => Ok(FlowStatus::Paused),
            "completed" => Ok(FlowStatus::Completed),
            "failed" => Ok(FlowStatus::Failed),
            "cancelled" => Ok(FlowStatus::Cancelled),
            other => Err(format!("unknown flow status: {}", other)),
        }
    }
}

/// Status of an individual step within a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Paused,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// A dependency is satisfied when the step finished without failing.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Why a flow is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    AwaitingRetry,
    AwaitingChildFlow,
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::Manual => write!(f, "manual"),
            PauseReason::AwaitingRetry => write!(f, "awaiting_retry"),
            PauseReason::AwaitingChildFlow => write!(f, "awaiting_child_flow"),
        }
    }
}

/// Classification of a step failure, driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network faults, provider-declared retryable conditions.
    Transient,
    /// Provider declined, validation failed. Never retried automatically.
    Business,
    Timeout,
    /// Scheduler or persistence fault.
    Internal,
    /// The step was in progress across a restart and did not declare
    /// idempotency.
    InterruptedNonIdempotent,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::InterruptedNonIdempotent
        )
    }
}

/// Error captured from a failed step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            stack_trace: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Recorded result of a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub is_success: bool,
    pub message: String,
    /// Writes merged into the data context on success.
    #[serde(default, skip_serializing_if = "DataMap::is_empty")]
    pub data: DataMap,
}

/// Report from a container step about one unit of its internal fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStepReport {
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A step's request to start a child flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub flow_type: String,
    #[serde(default, skip_serializing_if = "DataMap::is_empty")]
    pub initial_data: DataMap,
}

/// Durable record of a child flow spawned by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredFlowRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    pub flow_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FlowStatus>,
    pub triggered_by_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Back-reference from a child flow to the parent that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredBy {
    pub flow_id: String,
    pub triggered_by_step: String,
    pub flow_type: String,
}

/// What a step execution hands back to the scheduler.
///
/// `is_success = false` is treated identically to a thrown error for retry
/// classification; `error` carries the classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub is_success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "DataMap::is_empty")]
    pub data: DataMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered_flows: Vec<TriggerRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<SubStepReport>,
}

impl StepOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            is_success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn success_with(message: impl Into<String>, data: DataMap) -> Self {
        Self {
            is_success: true,
            message: message.into(),
            data,
            ..Default::default()
        }
    }

    pub fn failure(error: StepError) -> Self {
        Self {
            is_success: false,
            message: error.message.clone(),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: crate::context::DataValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_trigger(mut self, request: TriggerRequest) -> Self {
        self.triggered_flows.push(request);
        self
    }

    pub fn with_branch_hint(mut self, branch: impl Into<String>) -> Self {
        self.branch_hint = Some(branch.into());
        self
    }
}

/// A conditional or default successor path emitted by a step.
///
/// `steps` names definitions in the same flow type's pool; they are
/// instantiated with the flow and gated until this branch is selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    /// Predicate over the data context, e.g. `"amount > 100"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub steps: Vec<String>,
}

impl Branch {
    pub fn conditional(
        name: impl Into<String>,
        condition: impl Into<String>,
        steps: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            is_default: false,
            condition: Some(condition.into()),
            steps,
        }
    }

    pub fn default_branch(name: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            name: name.into(),
            is_default: true,
            condition: None,
            steps,
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

/// Static metadata a step definition exposes through `describe()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepMetadata {
    pub name: String,
    pub description: String,
    pub is_critical: bool,
    pub is_idempotent: bool,
    pub can_run_in_parallel: bool,
    pub max_retries: u32,
    /// Delay before an automatic retry, in seconds.
    pub retry_delay_s: f64,
    pub timeout_s: Option<f64>,
    pub priority: i32,
    pub resource_group: Option<String>,
    pub step_dependencies: Vec<String>,
    pub data_dependencies: BTreeMap<String, ValueKind>,
    /// Keys this step is allowed to overwrite in the data context.
    pub outputs: Vec<String>,
    pub branches: Vec<Branch>,
    /// When true, a completion that triggered child flows holds the step
    /// in progress until every child reaches a terminal status.
    pub await_triggered: bool,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            is_critical: true,
            is_idempotent: false,
            can_run_in_parallel: false,
            max_retries: 0,
            retry_delay_s: 1.0,
            timeout_s: None,
            priority: 0,
            resource_group: None,
            step_dependencies: Vec::new(),
            data_dependencies: BTreeMap::new(),
            outputs: Vec::new(),
            branches: Vec::new(),
            await_triggered: false,
        }
    }
}

impl StepMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.step_dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Membership of a branch-scoped step: the owning step and branch name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchOwner {
    pub step: String,
    pub branch: String,
}

/// A step instance inside one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInstance {
    pub name: String,
    pub status: StepStatus,
    pub index: usize,
    pub meta: StepMetadata,
    /// Set for branch-scoped steps; such a step is runnable only after its
    /// branch has been selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_of: Option<BranchOwner>,
    /// Set once this step's branch evaluation has chosen a successor path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
    /// Branch hint returned by the execution, held durably until branch
    /// evaluation runs (which may be after a child-flow wait or a restart).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_hint: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// When paused for retry: the earliest instant the retry sweep may
    /// re-enter the flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered_flows: Vec<TriggeredFlowRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<SubStepReport>,
    /// True when the step was closed out as skipped only because the flow
    /// reached a terminal status around it; `retry` revives such steps.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub closed_out: bool,
}

impl StepInstance {
    pub fn from_metadata(meta: StepMetadata, index: usize, branch_of: Option<BranchOwner>) -> Self {
        Self {
            name: meta.name.clone(),
            status: StepStatus::Pending,
            index,
            meta,
            branch_of,
            selected_branch: None,
            branch_hint: None,
            attempts: 0,
            result: None,
            error: None,
            resume_at: None,
            started_at: None,
            finished_at: None,
            triggered_flows: Vec::new(),
            sub_steps: Vec::new(),
            closed_out: false,
        }
    }

    /// True when a successful completion is recorded but the step is still
    /// held open waiting on triggered child flows.
    pub fn awaiting_children(&self) -> bool {
        self.status == StepStatus::InProgress
            && self.meta.await_triggered
            && self.result.as_ref().is_some_and(|r| r.is_success)
            && !self.triggered_flows.is_empty()
    }

    pub fn reset_for_retry(&mut self) {
        self.status = StepStatus::Pending;
        self.error = None;
        self.resume_at = None;
        self.started_at = None;
        self.finished_at = None;
    }
}

/// Entry in a flow's bounded event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: FlowEventType,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventType {
    FlowStarted,
    FlowPaused,
    FlowResumed,
    FlowCompleted,
    FlowFailed,
    FlowCancelled,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepRetryScheduled,
    BranchSelected,
    ChildFlowTriggered,
    ManuallyResolved,
    EngineFault,
}

/// Compact projection used by listings; avoids deserializing step vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_id: String,
    pub flow_type: String,
    pub status: FlowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub version: u64,
}

/// The serializable full state of a flow at a commit point.
///
/// Self-contained: a cold process can resume the flow from this alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub flow_id: String,
    pub flow_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: FlowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub data: DataContext,
    pub steps: Vec<StepInstance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<FlowEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<TriggeredBy>,
    pub version: u64,
    pub schema_version: u32,
}

impl FlowSnapshot {
    pub fn new(
        flow_id: impl Into<String>,
        flow_type: impl Into<String>,
        steps: Vec<StepInstance>,
        data: DataContext,
    ) -> Self {
        let total_steps = steps.len();
        Self {
            flow_id: flow_id.into(),
            flow_type: flow_type.into(),
            correlation_id: None,
            user_id: None,
            status: FlowStatus::Initializing,
            current_step_name: None,
            current_step_index: 0,
            total_steps,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            completed_at: None,
            pause_reason: None,
            pause_message: None,
            last_error: None,
            data,
            steps,
            events: Vec::new(),
            triggered_by: None,
            version: 0,
            schema_version: SNAPSHOT_SCHEMA_VERSION,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepInstance> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepInstance> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Append to the bounded event log, dropping the oldest entries beyond
    /// `tail_limit`.
    pub fn push_event(
        &mut self,
        event_type: FlowEventType,
        description: impl Into<String>,
        tail_limit: usize,
    ) {
        self.events.push(FlowEvent {
            timestamp: Utc::now(),
            event_type,
            description: description.into(),
        });
        if self.events.len() > tail_limit {
            let excess = self.events.len() - tail_limit;
            self.events.drain(..excess);
        }
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            flow_id: self.flow_id.clone(),
            flow_type: self.flow_type.clone(),
            status: self.status,
            correlation_id: self.correlation_id.clone(),
            user_id: self.user_id.clone(),
            current_step_name: self.current_step_name.clone(),
            current_step_index: self.current_step_index,
            total_steps: self.total_steps,
            created_at: self.created_at,
            completed_at: self.completed_at,
            last_error: self.last_error.clone(),
            version: self.version,
        }
    }
}
