//! Branch selection: conditionals, defaults, hints, and nesting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use vaultflow::catalog::{StepCatalog, StepHandler};
use vaultflow::context::{DataMap, DataValue};
use vaultflow::engine::types::{Branch, FlowEventType, FlowStatus, StepStatus};
use vaultflow::engine::{EngineError, StartOptions};

const WAIT: Duration = Duration::from_secs(5);

/// decide(amount) -> high_value [x] | default -> standard [y]
fn branching_handlers() -> Vec<Arc<dyn StepHandler>> {
    let mut decide = meta("decide");
    decide.branches = vec![
        Branch::conditional("high_value", "amount > 100", vec!["x".to_string()]),
        Branch::default_branch("standard", vec!["y".to_string()]),
    ];
    vec![
        WriteStep::new(decide),
        WriteStep::writing(meta("x"), "took", DataValue::Text("x".into())),
        WriteStep::writing(meta("y"), "took", DataValue::Text("y".into())),
    ]
}

fn amount(value: i64) -> DataMap {
    let mut data = DataMap::new();
    data.insert("amount".to_string(), DataValue::Int(value));
    data
}

#[tokio::test]
async fn conditional_branch_selected_when_satisfied() {
    let engine = engine_with("branching", branching_handlers());
    let flow_id = engine
        .start("branching", amount(150), StartOptions::default())
        .await
        .unwrap();
    let flow = wait_for_status(&engine, &flow_id, FlowStatus::Completed, WAIT).await;

    assert_eq!(flow.step("x").unwrap().status, StepStatus::Completed);
    assert_eq!(flow.step("y").unwrap().status, StepStatus::Skipped);
    assert_eq!(flow.data.get("took"), Some(&DataValue::Text("x".into())));
    assert_eq!(
        flow.step("decide").unwrap().selected_branch.as_deref(),
        Some("high_value")
    );
    assert!(flow
        .events
        .iter()
        .any(|e| e.event_type == FlowEventType::BranchSelected));
}

#[tokio::test]
async fn default_branch_selected_when_no_condition_matches() {
    let engine = engine_with("branching", branching_handlers());
    let flow_id = engine
        .start("branching", amount(50), StartOptions::default())
        .await
        .unwrap();
    let flow = wait_for_status(&engine, &flow_id, FlowStatus::Completed, WAIT).await;

    assert_eq!(flow.step("x").unwrap().status, StepStatus::Skipped);
    assert_eq!(flow.step("y").unwrap().status, StepStatus::Completed);
    assert_eq!(flow.data.get("took"), Some(&DataValue::Text("y".into())));
}

#[tokio::test]
async fn no_match_without_default_fails_the_step() {
    let mut decide = meta("decide");
    decide.branches = vec![Branch::conditional(
        "high_value",
        "amount > 100",
        vec!["x".to_string()],
    )];
    let engine = engine_with(
        "no-default",
        vec![WriteStep::new(decide), WriteStep::new(meta("x"))],
    );

    let flow_id = engine
        .start("no-default", amount(50), StartOptions::default())
        .await
        .unwrap();
    let flow = wait_for_status(&engine, &flow_id, FlowStatus::Failed, WAIT).await;

    assert_eq!(flow.step("decide").unwrap().status, StepStatus::Failed);
    assert!(flow.last_error.unwrap().contains("branch selection failed"));
}

#[tokio::test]
async fn branch_hint_overrides_conditions() {
    let mut decide = meta("decide");
    decide.branches = vec![
        Branch::conditional("high_value", "amount > 100", vec!["x".to_string()]),
        Branch::default_branch("standard", vec!["y".to_string()]),
    ];

    struct HintingStep {
        meta: vaultflow::engine::types::StepMetadata,
    }

    #[async_trait::async_trait]
    impl StepHandler for HintingStep {
        fn describe(&self) -> vaultflow::engine::types::StepMetadata {
            self.meta.clone()
        }

        async fn execute(
            &self,
            _input: vaultflow::catalog::StepInput,
        ) -> anyhow::Result<vaultflow::engine::types::StepOutcome> {
            Ok(vaultflow::engine::types::StepOutcome::success("decided")
                .with_branch_hint("standard"))
        }
    }

    let engine = engine_with(
        "hinted",
        vec![
            Arc::new(HintingStep { meta: decide }),
            WriteStep::new(meta("x")),
            WriteStep::new(meta("y")),
        ],
    );

    // The condition says "high_value" but the hint forces "standard".
    let flow_id = engine
        .start("hinted", amount(500), StartOptions::default())
        .await
        .unwrap();
    let flow = wait_for_status(&engine, &flow_id, FlowStatus::Completed, WAIT).await;

    assert_eq!(flow.step("y").unwrap().status, StepStatus::Completed);
    assert_eq!(flow.step("x").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn nested_branches_skip_transitively() {
    // decide -> inner (which itself declares a branch to leaf). Choosing the
    // other path must skip both inner and leaf.
    let mut decide = meta("decide");
    decide.branches = vec![
        Branch::conditional("deep", "go_deep == true", vec!["inner".to_string()]),
        Branch::default_branch("shallow", vec!["flat".to_string()]),
    ];
    let mut inner = meta("inner");
    inner.branches = vec![Branch::default_branch("leaf_path", vec!["leaf".to_string()])];

    let engine = engine_with(
        "nested",
        vec![
            WriteStep::new(decide),
            WriteStep::new(inner),
            WriteStep::new(meta("leaf")),
            WriteStep::new(meta("flat")),
        ],
    );

    let mut data = DataMap::new();
    data.insert("go_deep".to_string(), DataValue::Bool(false));
    let flow_id = engine
        .start("nested", data, StartOptions::default())
        .await
        .unwrap();
    let flow = wait_for_status(&engine, &flow_id, FlowStatus::Completed, WAIT).await;

    assert_eq!(flow.step("flat").unwrap().status, StepStatus::Completed);
    assert_eq!(flow.step("inner").unwrap().status, StepStatus::Skipped);
    assert_eq!(flow.step("leaf").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn nested_branch_path_executes_when_chosen() {
    let mut decide = meta("decide");
    decide.branches = vec![
        Branch::conditional("deep", "go_deep == true", vec!["inner".to_string()]),
        Branch::default_branch("shallow", vec!["flat".to_string()]),
    ];
    let mut inner = meta("inner");
    inner.branches = vec![Branch::default_branch("leaf_path", vec!["leaf".to_string()])];

    let engine = engine_with(
        "nested-deep",
        vec![
            WriteStep::new(decide),
            WriteStep::new(inner),
            WriteStep::writing(meta("leaf"), "depth", DataValue::Int(2)),
            WriteStep::new(meta("flat")),
        ],
    );

    let mut data = DataMap::new();
    data.insert("go_deep".to_string(), DataValue::Bool(true));
    let flow_id = engine
        .start("nested-deep", data, StartOptions::default())
        .await
        .unwrap();
    let flow = wait_for_status(&engine, &flow_id, FlowStatus::Completed, WAIT).await;

    assert_eq!(flow.step("inner").unwrap().status, StepStatus::Completed);
    assert_eq!(flow.step("leaf").unwrap().status, StepStatus::Completed);
    assert_eq!(flow.step("flat").unwrap().status, StepStatus::Skipped);
    assert_eq!(flow.data.get("depth"), Some(&DataValue::Int(2)));
}

#[tokio::test]
async fn branch_nesting_beyond_cap_is_rejected_at_registration() {
    // a -> b -> c -> d -> e -> f: five levels of nesting against a cap of 4.
    let names = ["a", "b", "c", "d", "e", "f"];
    let mut handlers: Vec<Arc<dyn StepHandler>> = Vec::new();
    for window in names.windows(2) {
        let mut m = meta(window[0]);
        m.branches = vec![Branch::default_branch(
            format!("to_{}", window[1]),
            vec![window[1].to_string()],
        )];
        handlers.push(WriteStep::new(m));
    }
    handlers.push(WriteStep::new(meta("f")));

    let catalog = StepCatalog::new(4);
    let error = catalog.register("too-deep", handlers).unwrap_err();
    assert!(matches!(error, EngineError::BranchNestingExceeded { .. }));
    assert_eq!(error.code(), "BranchNestingExceeded");
}

#[tokio::test]
async fn total_steps_accounting_holds_after_branch_selection() {
    let engine = engine_with("branching", branching_handlers());
    let flow_id = engine
        .start("branching", amount(150), StartOptions::default())
        .await
        .unwrap();
    let flow = wait_for_status(&engine, &flow_id, FlowStatus::Completed, WAIT).await;

    // Every pool step, branch-scoped ones included, is accounted for.
    assert_eq!(flow.total_steps, 3);
    assert_eq!(flow.steps.len(), flow.total_steps);
    assert_eq!(
        flow.steps.iter().filter(|s| s.status.is_terminal()).count(),
        flow.total_steps
    );
}
