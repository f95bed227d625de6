//! Trait contract tests for JobStore, RunStore and PlanStorage.
//!
//! Each contract runs against the in-memory fakes and, where the trait has
//! a database implementation, against SurrealDB's `mem://` engine.

use stackgate_state::fakes::{MemoryJobStore, MemoryPlanStorage, MemoryRunStore};
use stackgate_state::*;

// ===========================================================================
// JobStore
// ===========================================================================

async fn job_store_contract(store: &dyn JobStore) {
    let batch = BatchRecord::new(BatchType::Plan, "myorg/myrepo");
    let batch_id = batch.batch_id.clone();
    store.create_batch(batch).await.unwrap();

    let first = JobRecord::new(batch_id.clone(), "dev", serde_json::json!({"p": "dev"}), "dev-plan");
    let second = JobRecord::new(batch_id.clone(), "prod", serde_json::json!({"p": "prod"}), "prod-plan");
    let first_id = first.job_id.clone();
    store.create_job(first).await.unwrap();
    store.create_job(second).await.unwrap();

    let jobs = store.jobs_for_batch(&batch_id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].project_name, "dev");
    assert_eq!(jobs[1].project_name, "prod");

    store
        .set_job_status(&first_id, JobStatus::Triggered)
        .await
        .unwrap();
    assert_eq!(
        store.get_job(&first_id).await.unwrap().status,
        JobStatus::Triggered
    );

    store
        .set_batch_status(&batch_id, BatchStatus::Started)
        .await
        .unwrap();
    assert_eq!(
        store.get_batch(&batch_id).await.unwrap().status,
        BatchStatus::Started
    );

    let err = store
        .set_job_status(&JobId::from("missing"), JobStatus::Failed)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { kind: "job", .. }));
}

#[tokio::test]
async fn memory_job_store_contract() {
    job_store_contract(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn surreal_job_store_contract() {
    let store = SurrealStore::in_memory().await.unwrap();
    job_store_contract(&store).await;
}

// ===========================================================================
// RunStore
// ===========================================================================

fn run(project: &str) -> ProjectRun {
    ProjectRun::new(
        project,
        "myorg/myrepo",
        RunType::PlanAndApply,
        BatchId::new(),
        Some(BatchId::new()),
    )
}

async fn run_store_cas_contract(store: &dyn RunStore) {
    let r = run("dev");
    let run_id = r.run_id.clone();
    store.create_run(r).await.unwrap();

    let updated = store
        .compare_and_set_status(&run_id, 0, RunStatus::Planning)
        .await
        .unwrap();
    assert_eq!(updated.status, RunStatus::Planning);
    assert_eq!(updated.version, 1);

    // A second writer still holding version 0 loses.
    let err = store
        .compare_and_set_status(&run_id, 0, RunStatus::Failed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::VersionConflict {
            expected: 0,
            actual: 1,
            ..
        }
    ));
    assert_eq!(
        store.get_run(&run_id).await.unwrap().status,
        RunStatus::Planning
    );
}

async fn run_store_queue_contract(store: &dyn RunStore) {
    let a = run("dev");
    let b = run("dev");
    store.create_run(a.clone()).await.unwrap();
    store.create_run(b.clone()).await.unwrap();

    let first = store.enqueue(&a).await.unwrap();
    let second = store.enqueue(&b).await.unwrap();

    let items = store.queue_items().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, first.id);
    assert_eq!(items[1].id, second.id);

    store.dequeue(&first.id).await.unwrap();
    let items = store.queue_items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].run_id, b.run_id);
    assert_eq!(items[0].namespace, "myorg/myrepo");
    assert_eq!(items[0].project_key(), "myorg/myrepo#dev");

    // Dequeue of a missing item is a no-op.
    store.dequeue(&first.id).await.unwrap();
}

#[tokio::test]
async fn memory_run_store_cas_contract() {
    run_store_cas_contract(&MemoryRunStore::new()).await;
}

#[tokio::test]
async fn surreal_run_store_cas_contract() {
    let store = SurrealStore::in_memory().await.unwrap();
    run_store_cas_contract(&store).await;
}

#[tokio::test]
async fn memory_run_store_queue_contract() {
    run_store_queue_contract(&MemoryRunStore::new()).await;
}

#[tokio::test]
async fn surreal_run_store_queue_contract() {
    let store = SurrealStore::in_memory().await.unwrap();
    run_store_queue_contract(&store).await;
}

#[tokio::test]
async fn cas_on_missing_run_is_not_found() {
    let store = MemoryRunStore::new();
    let err = store
        .compare_and_set_status(&RunId::from("ghost"), 0, RunStatus::Planning)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { kind: "run", .. }));
}

// ===========================================================================
// PlanStorage
// ===========================================================================

#[tokio::test]
async fn memory_plan_storage_contract() {
    let storage = MemoryPlanStorage::new();
    assert_eq!(storage.retrieve_plan("a.tfplan").await.unwrap(), None);

    storage.store_plan("a.tfplan", b"bytes").await.unwrap();
    assert!(storage.plan_exists("a.tfplan").await.unwrap());

    storage.delete_stored_plan("a.tfplan").await.unwrap();
    storage.delete_stored_plan("a.tfplan").await.unwrap();
    assert!(storage.is_empty());
}
