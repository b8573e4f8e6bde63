//! End-to-end table migration driven by the scheduler: workflow steps on the
//! pool, the backfill job through the backend lifecycle, and the readiness
//! gate in front of the cut over.

mod common;

use std::sync::Arc;
use std::time::Duration;

use opsflow::backend::JobStatus;
use opsflow::migration::{MigrationContext, MigrationPlan, MigrationState, MigrationWorkflow, MIGRATION_WORKFLOW};
use opsflow::monitor::{LifecycleKind, RecordingSink};
use opsflow::store::{InMemoryStore, JobStore, WorkflowStore};
use opsflow::workflow::WorkflowStatus;
use opsflow::{CheckpointGate, JobDefinition, JobScheduler, SchedulerSettings, Valve, WorkflowRunner, WorkflowStateMachine};

use common::{FakeBackend, FakeMigrationService};

struct Setup {
    scheduler: JobScheduler,
    store: Arc<InMemoryStore>,
    service: Arc<FakeMigrationService>,
    backend: Arc<FakeBackend>,
    monitor: Arc<RecordingSink>,
}

fn setup(gate: CheckpointGate) -> Setup {
    let store = Arc::new(InMemoryStore::new());
    let monitor = Arc::new(RecordingSink::new());
    let backend = Arc::new(FakeBackend::new(4_200));
    let service = Arc::new(FakeMigrationService::default());
    let execution = common::execution(store.clone(), backend.clone(), monitor.clone());

    let workflow = MigrationWorkflow::new(service.clone(), execution.clone(), gate);
    let runner = WorkflowRunner::new(store.clone(), monitor.clone())
        .with_retry_delay(Duration::ZERO)
        .register(Arc::new(WorkflowStateMachine::new(workflow).unwrap()))
        .unwrap();

    let scheduler = JobScheduler::new(Arc::new(runner), execution, SchedulerSettings::default());
    Setup {
        scheduler,
        store,
        service,
        backend,
        monitor,
    }
}

async fn scan(setup: &Setup) {
    setup.scheduler.tick().await;
    setup.scheduler.wait_for_workflows().await;
}

async fn context(setup: &Setup, id: &str) -> MigrationContext {
    setup
        .store
        .load_workflow(id)
        .await
        .unwrap()
        .unwrap()
        .context_as()
        .unwrap()
}

#[tokio::test]
async fn test_migration_with_backfill_completes() {
    let setup = setup(CheckpointGate::new(
        Duration::from_secs(5),
        Valve::new(Duration::from_millis(200), Duration::from_millis(50)),
    ));
    let plan = MigrationPlan::new("orders", "ALTER TABLE orders ADD COLUMN region text")
        .with_backfill(JobDefinition::new("backfill", serde_json::json!({ "batch": 1000 })));
    let id = setup
        .scheduler
        .runner()
        .create(MIGRATION_WORKFLOW, &MigrationContext::new(plan))
        .await
        .unwrap();

    for _ in 0..20 {
        scan(&setup).await;
        let record = setup.store.load_workflow(&id).await.unwrap().unwrap();
        if record.status.is_archived() {
            break;
        }
    }

    let record = setup.store.load_workflow(&id).await.unwrap().unwrap();
    assert_eq!(record.status, WorkflowStatus::Completed);

    let ctx = context(&setup, &id).await;
    assert_eq!(ctx.state, MigrationState::Completed);
    assert_eq!(ctx.rows_copied, Some(4_200));

    let steps: Vec<&str> = record.history.iter().map(|h| h.to.as_str()).collect();
    assert_eq!(
        steps,
        vec!["shadow_ready", "backfilling", "replicating", "cut_over", "completed"]
    );

    let job = setup
        .store
        .load_job(ctx.backfill_job_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.properties.get("migration.shadow_table").map(String::as_str), Some("_orders_new"));
    assert_eq!(setup.backend.terminations.lock().unwrap().len(), 1);

    assert_eq!(
        setup.service.calls(),
        vec!["start orders", "cut_over mig-orders", "drop _orders_old"]
    );

    let kinds = setup.monitor.kinds();
    for kind in [
        LifecycleKind::TaskStart,
        LifecycleKind::TaskEnd,
        LifecycleKind::JobStart,
        LifecycleKind::JobStop,
        LifecycleKind::JobDestroy,
    ] {
        assert!(kinds.contains(&kind), "missing {kind:?}");
    }
}

#[tokio::test]
async fn test_lagging_replication_holds_cut_over_until_caught_up() {
    let setup = setup(CheckpointGate::new(
        Duration::from_secs(5),
        Valve::new(Duration::from_millis(100), Duration::from_millis(20)),
    ));
    *setup.service.lag_secs.lock().unwrap() = 600;

    let plan = MigrationPlan::new("users", "ALTER TABLE users DROP COLUMN legacy");
    let id = setup
        .scheduler
        .runner()
        .create(MIGRATION_WORKFLOW, &MigrationContext::new(plan))
        .await
        .unwrap();

    for _ in 0..5 {
        scan(&setup).await;
    }
    let ctx = context(&setup, &id).await;
    assert_eq!(ctx.state, MigrationState::Replicating);
    assert_eq!(ctx.failures, 0);
    assert!(setup.service.calls().iter().all(|c| !c.starts_with("cut_over")));
    assert!(setup.service.calls().iter().any(|c| c.starts_with("abort_cutover")));

    *setup.service.lag_secs.lock().unwrap() = 0;
    for _ in 0..3 {
        scan(&setup).await;
    }
    let record = setup.store.load_workflow(&id).await.unwrap().unwrap();
    assert_eq!(record.status, WorkflowStatus::Completed);
    assert!(setup.service.calls().contains(&"cut_over mig-users".to_string()));
}
