//! Tests for the file-backed workflow store: durability, ordering, and
//! lock table persistence across instances.

use sagaflow::engine::params::ParamStore;
use sagaflow::engine::types::{Direction, WorkflowRecord, WorkflowStatus};
use sagaflow::storage::json_store::JsonWorkflowStore;
use sagaflow::storage::{LockMode, WorkflowStore};

fn record(kind: &str) -> WorkflowRecord {
    WorkflowRecord::new(kind, ParamStore::new())
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonWorkflowStore::new(dir.path());

    let mut inputs = ParamStore::new();
    inputs.put("name", &"orders").unwrap();
    let original = WorkflowRecord::new("dataset_create", inputs);
    store.create(&original).await.unwrap();

    let loaded = store.get(&original.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, original.id);
    assert_eq!(loaded.kind, "dataset_create");
    assert_eq!(loaded.status, WorkflowStatus::Running);
    assert_eq!(loaded.inputs.get::<String>("name").unwrap(), "orders");
    assert_eq!(loaded.step_index, 0);
}

#[tokio::test]
async fn create_duplicate_id_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonWorkflowStore::new(dir.path());

    let r = record("dataset_create");
    store.create(&r).await.unwrap();
    assert!(store.create(&r).await.is_err());
}

#[tokio::test]
async fn get_unknown_id_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonWorkflowStore::new(dir.path());
    assert!(store.get("no-such-id").await.unwrap().is_none());
}

#[tokio::test]
async fn record_step_persists_resume_point() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonWorkflowStore::new(dir.path());

    let r = record("dataset_create");
    store.create(&r).await.unwrap();

    let mut working = ParamStore::new();
    working.put("dataset_id", &"abc-123").unwrap();
    store
        .record_step(&r.id, Direction::Undoing, 2, &working, Some("step 3 blew up"))
        .await
        .unwrap();

    // Read through a fresh instance: only the files count
    let reopened = JsonWorkflowStore::new(dir.path());
    let loaded = reopened.get(&r.id).await.unwrap().unwrap();
    assert_eq!(loaded.direction, Direction::Undoing);
    assert_eq!(loaded.step_index, 2);
    assert_eq!(loaded.working.get::<String>("dataset_id").unwrap(), "abc-123");
    assert_eq!(loaded.error.as_deref(), Some("step 3 blew up"));
    assert_eq!(loaded.status, WorkflowStatus::Running);
}

#[tokio::test]
async fn complete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonWorkflowStore::new(dir.path());

    let r = record("dataset_create");
    store.create(&r).await.unwrap();

    store
        .complete(&r.id, WorkflowStatus::Error, &r.working, Some("failed"))
        .await
        .unwrap();
    // A late duplicate completion must not overwrite the first
    store
        .complete(&r.id, WorkflowStatus::Success, &r.working, None)
        .await
        .unwrap();

    let loaded = store.get(&r.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, WorkflowStatus::Error);
    assert_eq!(loaded.error.as_deref(), Some("failed"));
    assert!(loaded.completed_at.is_some());
}

#[tokio::test]
async fn list_orders_by_submission_time() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonWorkflowStore::new(dir.path());

    let mut ids = Vec::new();
    for kind in ["dataset_create", "file_ingest", "snapshot_create"] {
        let r = record(kind);
        ids.push(r.id.clone());
        store.create(&r).await.unwrap();
        // Distinct submission timestamps
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let all = store.list(0, 10).await.unwrap();
    assert_eq!(all.len(), 3);
    let listed: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(listed, ids.iter().map(String::as_str).collect::<Vec<_>>());

    let page = store.list(1, 1).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, ids[1]);
}

#[tokio::test]
async fn recover_running_skips_terminal_workflows() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonWorkflowStore::new(dir.path());

    let running = record("dataset_create");
    let finished = record("dataset_delete");
    store.create(&running).await.unwrap();
    store.create(&finished).await.unwrap();
    store
        .complete(&finished.id, WorkflowStatus::Success, &finished.working, None)
        .await
        .unwrap();

    let recovered = store.recover_running().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, running.id);
}

#[tokio::test]
async fn delete_removes_record_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonWorkflowStore::new(dir.path());

    let r = record("dataset_create");
    store.create(&r).await.unwrap();
    store.delete(&r.id).await.unwrap();

    assert!(store.get(&r.id).await.unwrap().is_none());
    // Deleting again is fine
    store.delete(&r.id).await.unwrap();
}

#[tokio::test]
async fn lock_table_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = JsonWorkflowStore::new(dir.path());
        assert!(store.try_lock("dataset/a", LockMode::Exclusive, "w1").await.unwrap());
    }

    // A fresh instance over the same directory still sees the lock
    let reopened = JsonWorkflowStore::new(dir.path());
    assert!(!reopened.try_lock("dataset/a", LockMode::Exclusive, "w2").await.unwrap());

    let lock = reopened.get_lock("dataset/a").await.unwrap().unwrap();
    assert_eq!(lock.holders, vec!["w1"]);

    reopened.unlock("dataset/a", "w1").await.unwrap();
    assert!(reopened.try_lock("dataset/a", LockMode::Exclusive, "w2").await.unwrap());
}

#[tokio::test]
async fn lock_file_is_not_listed_as_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonWorkflowStore::new(dir.path());

    store.try_lock("dataset/a", LockMode::Exclusive, "w1").await.unwrap();
    let r = record("dataset_create");
    store.create(&r).await.unwrap();

    let all = store.list(0, 10).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, r.id);
}
