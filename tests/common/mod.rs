//! Shared test fixtures: step handlers and engine construction helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use vaultflow::catalog::{StepCatalog, StepHandler, StepInput};
use vaultflow::context::{DataMap, DataValue};
use vaultflow::engine::types::{
    FlowSnapshot, FlowStatus, StepError, StepMetadata, StepOutcome, SubStepReport, TriggerRequest,
};
use vaultflow::engine::{EngineConfig, FlowEngine};
use vaultflow::storage::FlowStore;
use vaultflow::storage::memory_store::MemoryStore;

/// Engine config tuned for fast tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_sweep_interval_s: 0.05,
        max_concurrent_steps: 4,
        ..EngineConfig::default()
    }
}

pub fn meta(name: &str) -> StepMetadata {
    StepMetadata::new(name)
}

pub fn engine_with(flow_type: &str, handlers: Vec<Arc<dyn StepHandler>>) -> FlowEngine {
    let store: Arc<dyn FlowStore> = Arc::new(MemoryStore::new());
    engine_on_store(flow_type, handlers, store)
}

pub fn engine_on_store(
    flow_type: &str,
    handlers: Vec<Arc<dyn StepHandler>>,
    store: Arc<dyn FlowStore>,
) -> FlowEngine {
    let config = fast_config();
    let catalog = Arc::new(StepCatalog::new(config.max_branch_depth));
    catalog.register(flow_type, handlers).unwrap();
    FlowEngine::new(catalog, store, config)
}

/// Poll until the flow reaches `status` or the timeout elapses.
pub async fn wait_for_status(
    engine: &FlowEngine,
    flow_id: &str,
    status: FlowStatus,
    timeout: Duration,
) -> FlowSnapshot {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let flow = engine.get(flow_id).await.unwrap();
        if flow.status == status {
            return flow;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "flow {} did not reach {:?} in time (status: {:?}, last_error: {:?})",
                flow_id, status, flow.status, flow.last_error
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `predicate` holds on the snapshot.
pub async fn wait_for<F>(
    engine: &FlowEngine,
    flow_id: &str,
    timeout: Duration,
    predicate: F,
) -> FlowSnapshot
where
    F: Fn(&FlowSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let flow = engine.get(flow_id).await.unwrap();
        if predicate(&flow) {
            return flow;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "flow {} did not satisfy predicate in time (status: {:?})",
                flow_id, flow.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ----- step handlers -----

/// Succeeds and writes the configured values into the data context.
pub struct WriteStep {
    pub meta: StepMetadata,
    pub writes: DataMap,
}

impl WriteStep {
    pub fn new(meta: StepMetadata) -> Arc<Self> {
        Arc::new(Self {
            meta,
            writes: DataMap::new(),
        })
    }

    pub fn writing(meta: StepMetadata, key: &str, value: DataValue) -> Arc<Self> {
        let mut writes = DataMap::new();
        writes.insert(key.to_string(), value);
        Arc::new(Self { meta, writes })
    }
}

#[async_trait]
impl StepHandler for WriteStep {
    fn describe(&self) -> StepMetadata {
        self.meta.clone()
    }

    async fn execute(&self, _input: StepInput) -> Result<StepOutcome> {
        Ok(StepOutcome::success_with("done", self.writes.clone()))
    }
}

/// Fails with a transient error on the first `fail_first` attempts, then
/// succeeds. Stateless: keyed off the attempt counter.
pub struct FlakyStep {
    pub meta: StepMetadata,
    pub fail_first: u32,
    pub writes: DataMap,
}

impl FlakyStep {
    pub fn new(meta: StepMetadata, fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            meta,
            fail_first,
            writes: DataMap::new(),
        })
    }
}

#[async_trait]
impl StepHandler for FlakyStep {
    fn describe(&self) -> StepMetadata {
        self.meta.clone()
    }

    async fn execute(&self, input: StepInput) -> Result<StepOutcome> {
        if input.attempt <= self.fail_first {
            return Ok(StepOutcome::failure(StepError::transient(format!(
                "flaky failure on attempt {}",
                input.attempt
            ))));
        }
        Ok(StepOutcome::success_with("recovered", self.writes.clone()))
    }
}

/// Fails the first `fail_first` executions across the handler's lifetime,
/// then succeeds. Unlike [`FlakyStep`] this counts executions, not the
/// per-step attempt number, so it survives manual retries that reset the
/// attempt counter.
pub struct CountingFlakyStep {
    pub meta: StepMetadata,
    pub fail_first: u32,
    executions: std::sync::atomic::AtomicU32,
}

impl CountingFlakyStep {
    pub fn new(meta: StepMetadata, fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            meta,
            fail_first,
            executions: std::sync::atomic::AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl StepHandler for CountingFlakyStep {
    fn describe(&self) -> StepMetadata {
        self.meta.clone()
    }

    async fn execute(&self, _input: StepInput) -> Result<StepOutcome> {
        let execution = self
            .executions
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if execution <= self.fail_first {
            return Ok(StepOutcome::failure(StepError::transient(format!(
                "failure on execution {}",
                execution
            ))));
        }
        Ok(StepOutcome::success("recovered"))
    }
}

/// Always fails with the given error.
pub struct FailStep {
    pub meta: StepMetadata,
    pub error: StepError,
}

impl FailStep {
    pub fn new(meta: StepMetadata, error: StepError) -> Arc<Self> {
        Arc::new(Self { meta, error })
    }
}

#[async_trait]
impl StepHandler for FailStep {
    fn describe(&self) -> StepMetadata {
        self.meta.clone()
    }

    async fn execute(&self, _input: StepInput) -> Result<StepOutcome> {
        Ok(StepOutcome::failure(self.error.clone()))
    }
}

/// Sleeps, honoring the cancellation signal.
pub struct SleepStep {
    pub meta: StepMetadata,
    pub seconds: f64,
}

impl SleepStep {
    pub fn new(meta: StepMetadata, seconds: f64) -> Arc<Self> {
        Arc::new(Self { meta, seconds })
    }
}

#[async_trait]
impl StepHandler for SleepStep {
    fn describe(&self) -> StepMetadata {
        self.meta.clone()
    }

    async fn execute(&self, mut input: StepInput) -> Result<StepOutcome> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(self.seconds)) => {
                Ok(StepOutcome::success("slept"))
            }
            _ = input.cancel.changed() => {
                Ok(StepOutcome::failure(StepError::business("cancelled by signal")))
            }
        }
    }
}

/// Succeeds and asks the engine to start a child flow.
pub struct TriggerStep {
    pub meta: StepMetadata,
    pub child_type: String,
    pub child_data: DataMap,
}

impl TriggerStep {
    pub fn new(meta: StepMetadata, child_type: &str) -> Arc<Self> {
        Arc::new(Self {
            meta,
            child_type: child_type.to_string(),
            child_data: DataMap::new(),
        })
    }
}

#[async_trait]
impl StepHandler for TriggerStep {
    fn describe(&self) -> StepMetadata {
        self.meta.clone()
    }

    async fn execute(&self, _input: StepInput) -> Result<StepOutcome> {
        Ok(
            StepOutcome::success("triggered").with_trigger(TriggerRequest {
                flow_type: self.child_type.clone(),
                initial_data: self.child_data.clone(),
            }),
        )
    }
}

/// Records its execution into a shared log, then succeeds.
pub struct TraceStep {
    pub meta: StepMetadata,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl TraceStep {
    pub fn new(meta: StepMetadata, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self { meta, log })
    }
}

#[async_trait]
impl StepHandler for TraceStep {
    fn describe(&self) -> StepMetadata {
        self.meta.clone()
    }

    async fn execute(&self, _input: StepInput) -> Result<StepOutcome> {
        self.log.lock().unwrap().push(self.meta.name.clone());
        Ok(StepOutcome::success("traced"))
    }
}

/// Container step reporting an internal fan-out as sub-steps.
pub struct FanOutStep {
    pub meta: StepMetadata,
    pub units: Vec<String>,
}

impl FanOutStep {
    pub fn new(meta: StepMetadata, units: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            meta,
            units: units.into_iter().map(str::to_string).collect(),
        })
    }
}

#[async_trait]
impl StepHandler for FanOutStep {
    fn describe(&self) -> StepMetadata {
        self.meta.clone()
    }

    async fn execute(&self, _input: StepInput) -> Result<StepOutcome> {
        let mut outcome = StepOutcome::success("fan-out done");
        outcome.sub_steps = self
            .units
            .iter()
            .map(|unit| SubStepReport {
                name: unit.clone(),
                status: vaultflow::engine::types::StepStatus::Completed,
                message: None,
            })
            .collect();
        Ok(outcome)
    }
}
