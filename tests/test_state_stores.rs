//! Tests for FlowStore implementations: MemoryStore, JsonStore, SqliteStore.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use vaultflow::context::DataContext;
use vaultflow::engine::types::{FlowSnapshot, FlowStatus, StepInstance, StepStatus};
use vaultflow::storage::json_store::JsonStore;
use vaultflow::storage::memory_store::MemoryStore;
use vaultflow::storage::sqlite_store::SqliteStore;
use vaultflow::storage::{FlowFilter, FlowStore, Pagination, StoreError};

fn snapshot(flow_id: &str, status: FlowStatus) -> FlowSnapshot {
    let steps = vec![StepInstance::from_metadata(meta("only"), 0, None)];
    let mut flow = FlowSnapshot::new(flow_id, "test-type", steps, DataContext::new());
    flow.status = status;
    flow.version = 1;
    flow
}

async fn exercise_crud(store: Arc<dyn FlowStore>) {
    // insert + load round-trip
    let flow = snapshot("f1", FlowStatus::Running);
    store.insert(&flow).await.unwrap();
    let loaded = store.load("f1").await.unwrap().unwrap();
    assert_eq!(loaded, flow);

    // duplicate insert is rejected
    let dup = store.insert(&flow).await.unwrap_err();
    assert!(matches!(dup, StoreError::AlreadyExists { .. }));

    // CAS happy path
    let mut updated = flow.clone();
    updated.version = 2;
    updated.status = FlowStatus::Paused;
    store.update(&updated, 1).await.unwrap();
    assert_eq!(
        store.load("f1").await.unwrap().unwrap().status,
        FlowStatus::Paused
    );

    // CAS conflict: stale expected version
    let mut stale = flow.clone();
    stale.version = 2;
    let conflict = store.update(&stale, 1).await.unwrap_err();
    assert!(matches!(
        conflict,
        StoreError::VersionConflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));

    // update of a missing flow
    let ghost = snapshot("ghost", FlowStatus::Running);
    let missing = store.update(&ghost, 1).await.unwrap_err();
    assert!(matches!(missing, StoreError::NotFound { .. }));

    // load of a missing flow is None, delete reports absence
    assert!(store.load("ghost").await.unwrap().is_none());
    assert!(store.delete("f1").await.unwrap());
    assert!(!store.delete("f1").await.unwrap());
}

async fn exercise_queries(store: Arc<dyn FlowStore>) {
    for (id, status) in [
        ("q1", FlowStatus::Running),
        ("q2", FlowStatus::Completed),
        ("q3", FlowStatus::Failed),
        ("q4", FlowStatus::Paused),
    ] {
        let mut flow = snapshot(id, status);
        flow.user_id = Some("user-1".to_string());
        if id == "q2" {
            flow.correlation_id = Some("corr-9".to_string());
        }
        store.insert(&flow).await.unwrap();
    }

    // non-terminal scan
    let live = store.list_non_terminal().await.unwrap();
    let mut live_ids: Vec<&str> = live.iter().map(|f| f.flow_id.as_str()).collect();
    live_ids.sort();
    assert_eq!(live_ids, vec!["q1", "q4"]);

    // status filter
    let page = store
        .list(
            &FlowFilter {
                status: Some(FlowStatus::Completed),
                ..Default::default()
            },
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].flow_id, "q2");

    // correlation filter
    let page = store
        .list(
            &FlowFilter {
                correlation_id: Some("corr-9".to_string()),
                ..Default::default()
            },
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);

    // pagination bounds
    let page = store
        .list(
            &FlowFilter::default(),
            &Pagination {
                offset: 0,
                limit: 2,
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.items.len(), 2);

    // counts per status
    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts.get(&FlowStatus::Running), Some(&1));
    assert_eq!(counts.get(&FlowStatus::Completed), Some(&1));
    assert_eq!(counts.values().sum::<u64>(), 4);

    // purge removes only old terminal flows
    let removed = store
        .purge_terminal_before(Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, 2); // q2 and q3
    assert!(store.load("q1").await.unwrap().is_some());
    assert!(store.load("q2").await.unwrap().is_none());
}

// ===== MemoryStore =====

#[tokio::test]
async fn memory_store_crud() {
    exercise_crud(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn memory_store_queries() {
    exercise_queries(Arc::new(MemoryStore::new())).await;
}

// ===== JsonStore =====

#[tokio::test]
async fn json_store_crud() {
    let dir = tempfile::tempdir().unwrap();
    exercise_crud(Arc::new(JsonStore::new(dir.path()))).await;
}

#[tokio::test]
async fn json_store_queries() {
    let dir = tempfile::tempdir().unwrap();
    exercise_queries(Arc::new(JsonStore::new(dir.path()))).await;
}

#[tokio::test]
async fn json_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = JsonStore::new(dir.path());
        store
            .insert(&snapshot("persist-1", FlowStatus::Paused))
            .await
            .unwrap();
    }
    let store = JsonStore::new(dir.path());
    let loaded = store.load("persist-1").await.unwrap().unwrap();
    assert_eq!(loaded.status, FlowStatus::Paused);
    assert_eq!(loaded.steps[0].status, StepStatus::Pending);
}

// ===== SqliteStore =====

#[tokio::test]
async fn sqlite_store_crud() {
    let store = SqliteStore::in_memory().await.unwrap();
    exercise_crud(Arc::new(store)).await;
}

#[tokio::test]
async fn sqlite_store_queries() {
    let store = SqliteStore::in_memory().await.unwrap();
    exercise_queries(Arc::new(store)).await;
}

#[tokio::test]
async fn sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("flows.db").display());
    {
        let store = SqliteStore::connect(&url).await.unwrap();
        store
            .insert(&snapshot("persist-1", FlowStatus::Paused))
            .await
            .unwrap();
    }
    let store = SqliteStore::connect(&url).await.unwrap();
    let loaded = store.load("persist-1").await.unwrap().unwrap();
    assert_eq!(loaded.status, FlowStatus::Paused);
}

// ===== An engine runs unchanged on every backend =====

#[tokio::test]
async fn engine_runs_on_json_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn FlowStore> = Arc::new(JsonStore::new(dir.path()));
    let engine = engine_on_store(
        "portable",
        vec![WriteStep::new(meta("only"))],
        store,
    );
    let flow_id = engine
        .start(
            "portable",
            Default::default(),
            vaultflow::engine::StartOptions::default(),
        )
        .await
        .unwrap();
    wait_for_status(
        &engine,
        &flow_id,
        FlowStatus::Completed,
        std::time::Duration::from_secs(5),
    )
    .await;
}

#[tokio::test]
async fn engine_runs_on_sqlite_store() {
    let store: Arc<dyn FlowStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let engine = engine_on_store(
        "portable",
        vec![WriteStep::new(meta("only"))],
        store,
    );
    let flow_id = engine
        .start(
            "portable",
            Default::default(),
            vaultflow::engine::StartOptions::default(),
        )
        .await
        .unwrap();
    wait_for_status(
        &engine,
        &flow_id,
        FlowStatus::Completed,
        std::time::Duration::from_secs(5),
    )
    .await;
}
