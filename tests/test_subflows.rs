//! Parent/child flow triggering: fire-and-forget, awaited children, and
//! inherited correlation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use vaultflow::catalog::{StepCatalog, StepHandler};
use vaultflow::context::DataValue;
use vaultflow::engine::types::{FlowStatus, PauseReason, StepStatus};
use vaultflow::engine::{EngineConfig, FlowEngine, StartOptions};
use vaultflow::storage::FlowStore;
use vaultflow::storage::memory_store::MemoryStore;

const WAIT: Duration = Duration::from_secs(10);

/// An engine with a parent flow type (one triggering step and a follow-up)
/// and a child "payment" flow type.
fn parent_child_engine(await_triggered: bool, child_sleep_s: f64) -> FlowEngine {
    let mut trigger = meta("charge");
    trigger.await_triggered = await_triggered;

    let parent: Vec<Arc<dyn StepHandler>> = vec![
        TriggerStep::new(trigger, "payment"),
        WriteStep::writing(meta("notify").depends_on(&["charge"]), "notified", DataValue::Bool(true)),
    ];
    let child: Vec<Arc<dyn StepHandler>> = vec![SleepStep::new(meta("settle"), child_sleep_s)];

    let config = fast_config();
    let catalog = Arc::new(StepCatalog::new(config.max_branch_depth));
    catalog.register("subscription", parent).unwrap();
    catalog.register("payment", child).unwrap();
    let store: Arc<dyn FlowStore> = Arc::new(MemoryStore::new());
    FlowEngine::new(catalog, store, config)
}

#[tokio::test]
async fn fire_and_forget_trigger_does_not_block_the_parent() {
    let engine = parent_child_engine(false, 0.3);

    let options = StartOptions {
        correlation_id: Some("corr-77".to_string()),
        user_id: Some("user-9".to_string()),
        ..Default::default()
    };
    let parent_id = engine
        .start("subscription", Default::default(), options)
        .await
        .unwrap();
    let parent = wait_for_status(&engine, &parent_id, FlowStatus::Completed, WAIT).await;

    let charge = parent.step("charge").unwrap();
    assert_eq!(charge.triggered_flows.len(), 1);
    let child_ref = &charge.triggered_flows[0];
    assert_eq!(child_ref.flow_type, "payment");
    let child_id = child_ref.flow_id.clone().unwrap();

    let child = wait_for_status(&engine, &child_id, FlowStatus::Completed, WAIT).await;
    // The child inherited the correlation and points back at its parent.
    assert_eq!(child.correlation_id.as_deref(), Some("corr-77"));
    let triggered_by = child.triggered_by.unwrap();
    assert_eq!(triggered_by.flow_id, parent_id);
    assert_eq!(triggered_by.triggered_by_step, "charge");
}

#[tokio::test]
async fn awaited_child_pauses_parent_until_terminal() {
    let engine = parent_child_engine(true, 0.3);

    let parent_id = engine
        .start("subscription", Default::default(), StartOptions::default())
        .await
        .unwrap();

    // The parent pauses awaiting its child, with the triggering step held
    // in progress.
    let paused = wait_for(&engine, &parent_id, WAIT, |f| {
        f.status == FlowStatus::Paused
    })
    .await;
    assert_eq!(paused.pause_reason, Some(PauseReason::AwaitingChildFlow));
    assert_eq!(paused.step("charge").unwrap().status, StepStatus::InProgress);
    assert_eq!(paused.step("notify").unwrap().status, StepStatus::Pending);

    // Once the child completes, the parent resumes automatically and runs
    // its remaining steps.
    let parent = wait_for_status(&engine, &parent_id, FlowStatus::Completed, WAIT).await;
    assert_eq!(parent.step("charge").unwrap().status, StepStatus::Completed);
    assert_eq!(parent.data.get("notified"), Some(&DataValue::Bool(true)));

    let child_ref = &parent.step("charge").unwrap().triggered_flows[0];
    assert_eq!(child_ref.status, Some(FlowStatus::Completed));
}

#[tokio::test]
async fn awaited_child_that_fails_still_releases_the_parent() {
    // Child's only step fails permanently; terminal is terminal, so the
    // parent must still resume.
    let mut trigger = meta("charge");
    trigger.await_triggered = true;
    let parent: Vec<Arc<dyn StepHandler>> = vec![TriggerStep::new(trigger, "payment")];
    let child: Vec<Arc<dyn StepHandler>> = vec![FailStep::new(
        meta("settle"),
        vaultflow::engine::types::StepError::business("insufficient funds"),
    )];

    let config = fast_config();
    let catalog = Arc::new(StepCatalog::new(config.max_branch_depth));
    catalog.register("subscription", parent).unwrap();
    catalog.register("payment", child).unwrap();
    let store: Arc<dyn FlowStore> = Arc::new(MemoryStore::new());
    let engine = FlowEngine::new(catalog, store, config);

    let parent_id = engine
        .start("subscription", Default::default(), StartOptions::default())
        .await
        .unwrap();
    let parent = wait_for_status(&engine, &parent_id, FlowStatus::Completed, WAIT).await;

    let child_ref = &parent.step("charge").unwrap().triggered_flows[0];
    assert_eq!(child_ref.status, Some(FlowStatus::Failed));
}

#[tokio::test]
async fn unknown_child_flow_type_fails_the_triggering_step() {
    let trigger = meta("charge");
    let parent: Vec<Arc<dyn StepHandler>> = vec![TriggerStep::new(trigger, "no-such-type")];

    let config = fast_config();
    let catalog = Arc::new(StepCatalog::new(config.max_branch_depth));
    catalog.register("subscription", parent).unwrap();
    let store: Arc<dyn FlowStore> = Arc::new(MemoryStore::new());
    let engine = FlowEngine::new(catalog, store, config);

    let parent_id = engine
        .start("subscription", Default::default(), StartOptions::default())
        .await
        .unwrap();
    let parent = wait_for_status(&engine, &parent_id, FlowStatus::Failed, WAIT).await;
    assert!(
        parent
            .last_error
            .unwrap()
            .contains("failed to trigger child flow")
    );
}

#[tokio::test]
async fn child_engine_config_is_shared() {
    // Child flows run on the same engine and store; a deep chain still
    // terminates. parent -> payment -> (no further children).
    let engine = parent_child_engine(false, 0.01);
    let parent_id = engine
        .start("subscription", Default::default(), StartOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &parent_id, FlowStatus::Completed, WAIT).await;

    let stats = engine.statistics().await.unwrap();
    assert_eq!(stats.total, 2);
    let config: &EngineConfig = engine.config();
    assert!(config.max_branch_depth >= 1);
}
