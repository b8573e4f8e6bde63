//! Records written by one process are picked up by the next: workflows resume
//! from their persisted context and concurrent writers are fenced by version.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use opsflow::migration::{MigrationContext, MigrationPlan, MigrationState, MigrationWorkflow, MIGRATION_WORKFLOW};
use opsflow::monitor::RecordingSink;
use opsflow::store::{FileSystemStore, JobStore, StoreError, WorkflowStore};
use opsflow::workflow::{DriveOutcome, WorkflowRecord, WorkflowStatus};
use opsflow::{CheckpointGate, JobDefinition, Valve, WorkflowRunner, WorkflowStateMachine};

use common::{FakeBackend, FakeMigrationService};

fn gate() -> CheckpointGate {
    CheckpointGate::new(
        Duration::from_secs(5),
        Valve::new(Duration::from_millis(100), Duration::from_millis(20)),
    )
}

async fn runner_over(store: Arc<FileSystemStore>, service: Arc<FakeMigrationService>) -> WorkflowRunner {
    let monitor = Arc::new(RecordingSink::new());
    let execution = common::execution(store.clone(), Arc::new(FakeBackend::new(0)), monitor.clone());
    let workflow = MigrationWorkflow::new(service, execution, gate());
    WorkflowRunner::new(store, monitor)
        .with_retry_delay(Duration::ZERO)
        .register(Arc::new(WorkflowStateMachine::new(workflow).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn test_workflow_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let plan = MigrationPlan::new("orders", "ALTER TABLE orders ADD COLUMN region text");

    let id = {
        let store = Arc::new(FileSystemStore::open(dir.path()).await.unwrap());
        let first = Arc::new(FakeMigrationService::default());
        let runner = runner_over(store, first.clone()).await;
        let id = runner.create(MIGRATION_WORKFLOW, &MigrationContext::new(plan)).await.unwrap();
        runner.run_once(&id).await.unwrap();
        runner.run_once(&id).await.unwrap();
        assert_eq!(first.calls(), vec!["start orders"]);
        id
    };

    let store = Arc::new(FileSystemStore::open(dir.path()).await.unwrap());
    let record = store.load_workflow(&id).await.unwrap().unwrap();
    let context: MigrationContext = record.context_as().unwrap();
    assert_eq!(context.state, MigrationState::Replicating);
    assert_eq!(context.migration_id.as_deref(), Some("mig-orders"));
    assert_eq!(record.version, 2);

    let second = Arc::new(FakeMigrationService::default());
    let runner = runner_over(store.clone(), second.clone()).await;
    runner.run_once(&id).await.unwrap();
    runner.run_once(&id).await.unwrap();
    let last = runner.run_once(&id).await.unwrap();
    assert_eq!(last.outcome, DriveOutcome::Completed);

    // The restarted process never re-ran the steps the first one finished.
    assert_eq!(second.calls(), vec!["cut_over mig-orders", "drop _orders_old"]);

    let record = store.load_workflow(&id).await.unwrap().unwrap();
    assert_eq!(record.status, WorkflowStatus::Completed);
    assert_eq!(record.history.len(), 4);
    assert!(store.list_due_workflows(chrono::Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_two_handles_on_one_directory_are_fenced_by_version() {
    let dir = TempDir::new().unwrap();
    let a = FileSystemStore::open(dir.path()).await.unwrap();
    let b = FileSystemStore::open(dir.path()).await.unwrap();

    let record = WorkflowRecord::new("noop", &serde_json::json!({ "n": 0 })).unwrap();
    a.insert_workflow(&record).await.unwrap();

    let mut from_a = a.load_workflow(&record.id).await.unwrap().unwrap();
    let mut from_b = b.load_workflow(&record.id).await.unwrap().unwrap();

    from_a.context = serde_json::json!({ "n": 1 });
    a.save_workflow(&mut from_a).await.unwrap();
    assert_eq!(from_a.version, 1);

    from_b.context = serde_json::json!({ "n": 2 });
    let err = b.save_workflow(&mut from_b).await.unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { expected: 0, found: 1, .. }));
    assert!(err.is_retryable());

    let stored = b.load_workflow(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.context, serde_json::json!({ "n": 1 }));
}

#[tokio::test]
async fn test_submitted_job_is_visible_to_a_fresh_handle() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileSystemStore::open(dir.path()).await.unwrap());
    let execution = common::execution(
        store.clone(),
        Arc::new(FakeBackend::new(0)),
        Arc::new(RecordingSink::new()),
    );

    let job_id = execution
        .submit(JobDefinition::new("backfill", serde_json::json!({ "batch": 10 })).with_property("image", "worker:2"))
        .await
        .unwrap();

    let reopened = FileSystemStore::open(dir.path()).await.unwrap();
    let active = reopened.list_active_jobs().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, job_id);
    assert_eq!(active[0].properties.get("image").map(String::as_str), Some("worker:2"));
}
