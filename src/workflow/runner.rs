use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use super::action::ActionError;
use super::machine::{ScheduleOutcome, WorkflowStateMachine, WorkflowType};
use super::record::{HistoryEntry, WorkflowRecord, WorkflowStatus};
use crate::error::OpsflowError;
use crate::monitor::{workflow_span, LifecycleEvent, LifecycleKind, MonitoringSink};
use crate::store::{StoreError, WorkflowStore};

#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    Advanced { to: String, action: String },
    Failed { action: String, error: ActionError },
    Completed,
    Abandoned { reason: String },
    /// The record was already archived; nothing ran.
    Archived,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriveReport {
    pub workflow_id: String,
    pub state: String,
    pub outcome: DriveOutcome,
}

/// A workflow type with its context type erased to JSON, so one runner can
/// hold every registered type.
#[async_trait]
pub trait WorkflowDriver: Send + Sync {
    fn type_tag(&self) -> &str;

    /// Run one `schedule()` step against the record's context and fold the
    /// outcome into the record. Does not persist.
    async fn drive(&self, record: &mut WorkflowRecord) -> Result<DriveReport, OpsflowError>;
}

#[async_trait]
impl<W> WorkflowDriver for WorkflowStateMachine<W>
where
    W: WorkflowType,
    W::Context: Serialize + DeserializeOwned,
{
    fn type_tag(&self) -> &str {
        self.workflow().type_tag()
    }

    async fn drive(&self, record: &mut WorkflowRecord) -> Result<DriveReport, OpsflowError> {
        let mut context: W::Context = record.context_as()?;
        let outcome = self.schedule(&mut context).await;
        record.context = serde_json::to_value(&context)?;

        let (state, outcome) = match outcome {
            ScheduleOutcome::Advanced {
                from,
                to,
                action,
                outcome,
            } => {
                record.history.push(HistoryEntry {
                    from: from.to_string(),
                    to: to.to_string(),
                    action: action.clone(),
                    summary: outcome.summary,
                    at: Utc::now(),
                });
                record.failed_attempts = 0;
                record.last_error = None;
                (
                    from.to_string(),
                    DriveOutcome::Advanced {
                        to: to.to_string(),
                        action,
                    },
                )
            }
            ScheduleOutcome::Failed { state, action, error } => {
                // Waiting on an external condition is not a failure.
                if !error.is_not_ready() {
                    record.failed_attempts += 1;
                }
                record.last_error = Some(format!("{action}: {error}"));
                (state.to_string(), DriveOutcome::Failed { action, error })
            }
            ScheduleOutcome::Terminal { state } => {
                record.status = WorkflowStatus::Completed;
                (state.to_string(), DriveOutcome::Completed)
            }
            ScheduleOutcome::Abandoned { state, reason } => {
                record.status = WorkflowStatus::Abandoned;
                record.last_error = Some(reason.clone());
                (state.to_string(), DriveOutcome::Abandoned { reason })
            }
        };

        Ok(DriveReport {
            workflow_id: record.id.clone(),
            state,
            outcome,
        })
    }
}

/// Loads a workflow record, runs one step, and saves it back under the
/// version it was loaded with.
pub struct WorkflowRunner {
    store: Arc<dyn WorkflowStore>,
    monitor: Arc<dyn MonitoringSink>,
    drivers: HashMap<String, Arc<dyn WorkflowDriver>>,
    retry_delay: Duration,
}

impl WorkflowRunner {
    pub fn new(store: Arc<dyn WorkflowStore>, monitor: Arc<dyn MonitoringSink>) -> Self {
        Self {
            store,
            monitor,
            drivers: HashMap::new(),
            retry_delay: Duration::from_secs(30),
        }
    }

    /// Add a workflow type. Tags must be unique.
    pub fn register(mut self, driver: Arc<dyn WorkflowDriver>) -> Result<Self, OpsflowError> {
        let tag = driver.type_tag().to_string();
        if self.drivers.contains_key(&tag) {
            return Err(OpsflowError::configuration(format!(
                "workflow type '{tag}' registered twice"
            )));
        }
        self.drivers.insert(tag, driver);
        Ok(self)
    }

    /// Delay before a failed step is retried.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub async fn create<C: Serialize>(&self, workflow_type: &str, context: &C) -> Result<String, OpsflowError> {
        if !self.drivers.contains_key(workflow_type) {
            return Err(OpsflowError::configuration(format!(
                "unknown workflow type '{workflow_type}'"
            )));
        }
        let record = WorkflowRecord::new(workflow_type, context)?;
        self.store.insert_workflow(&record).await?;
        info!(workflow_id = %record.id, workflow_type = %workflow_type, "Workflow created");
        Ok(record.id)
    }

    /// Run one step of `workflow_id`.
    ///
    /// The updated record is saved before returning. A failed action comes
    /// back as [`OpsflowError::ActionFailure`] and an abandoned workflow as
    /// [`OpsflowError::TerminalWorkflow`]; a lost save race comes back as a
    /// retryable store error and the step's effects on the record are dropped.
    pub async fn run_once(&self, workflow_id: &str) -> Result<DriveReport, OpsflowError> {
        let mut record = self
            .store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| OpsflowError::configuration(format!("unknown workflow '{workflow_id}'")))?;

        if record.status.is_archived() {
            return Ok(DriveReport {
                workflow_id: record.id,
                state: String::new(),
                outcome: DriveOutcome::Archived,
            });
        }

        let driver = self.drivers.get(&record.workflow_type).cloned().ok_or_else(|| {
            OpsflowError::configuration(format!("unknown workflow type '{}'", record.workflow_type))
        })?;

        let span = workflow_span(&record.id, &record.workflow_type, &Uuid::new_v4().to_string());
        self.step(driver, &mut record).instrument(span).await
    }

    async fn step(&self, driver: Arc<dyn WorkflowDriver>, record: &mut WorkflowRecord) -> Result<DriveReport, OpsflowError> {
        let id = record.id.clone();
        let tag = record.workflow_type.clone();
        self.monitor
            .emit(&LifecycleEvent::success(LifecycleKind::TaskStart, &id, &tag));

        let report = match driver.drive(record).await {
            Ok(report) => report,
            Err(e) => {
                self.monitor
                    .emit(&LifecycleEvent::failure(LifecycleKind::TaskFail, &id, &tag, e.to_string()));
                return Err(e);
            }
        };

        let now = Utc::now();
        record.next_run_at = match &report.outcome {
            DriveOutcome::Failed { .. } => {
                now + chrono::Duration::from_std(self.retry_delay).unwrap_or_else(|_| chrono::Duration::seconds(30))
            }
            _ => now,
        };

        if let Err(e) = self.store.save_workflow(record).await {
            if matches!(e, StoreError::VersionConflict { .. }) {
                warn!(workflow_id = %id, error = %e, "Workflow was updated concurrently, deferring to next tick");
                self.monitor.emit(&LifecycleEvent::failure(
                    LifecycleKind::TaskInterrupt,
                    &id,
                    &tag,
                    e.to_string(),
                ));
            }
            return Err(e.into());
        }

        match &report.outcome {
            DriveOutcome::Advanced { to, action } => {
                info!(workflow_id = %id, from = %report.state, to = %to, action = %action, "Workflow advanced");
                self.monitor
                    .emit(&LifecycleEvent::success(LifecycleKind::TaskEnd, &id, &tag));
                Ok(report)
            }
            DriveOutcome::Completed | DriveOutcome::Archived => {
                info!(workflow_id = %id, state = %report.state, "Workflow completed");
                self.monitor
                    .emit(&LifecycleEvent::success(LifecycleKind::TaskEnd, &id, &tag));
                Ok(report)
            }
            DriveOutcome::Failed { action, error } if error.is_not_ready() => {
                info!(workflow_id = %id, action = %action, reason = %error, "Workflow waiting on external condition");
                self.monitor
                    .emit(&LifecycleEvent::success(LifecycleKind::TaskEnd, &id, &tag));
                Ok(report)
            }
            DriveOutcome::Failed { action, error } => {
                self.monitor.emit(&LifecycleEvent::failure(
                    LifecycleKind::TaskFail,
                    &id,
                    &tag,
                    error.to_string(),
                ));
                Err(OpsflowError::ActionFailure {
                    action: action.clone(),
                    source: error.clone(),
                })
            }
            DriveOutcome::Abandoned { reason } => {
                self.monitor
                    .emit(&LifecycleEvent::failure(LifecycleKind::TaskFail, &id, &tag, reason.clone()));
                Err(OpsflowError::TerminalWorkflow {
                    workflow_id: id,
                    reason: reason.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::RecordingSink;
    use crate::store::InMemoryStore;
    use crate::workflow::action::{Action, ActionOutcome, ActionTable};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        step: u32,
        #[serde(default)]
        failures: u32,
        #[serde(default)]
        blocked: bool,
    }

    struct Increment {
        broken: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Action<Counter> for Increment {
        fn name(&self) -> &str {
            "increment"
        }

        async fn execute(&self, context: &Counter) -> Result<ActionOutcome, ActionError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ActionError::Failed("disk full".to_string()));
            }
            if context.blocked {
                return Err(ActionError::NotReady("upstream busy".to_string()));
            }
            Ok(ActionOutcome::done(format!("step {}", context.step)))
        }
    }

    struct Stepper {
        table: ActionTable<u32, Counter>,
    }

    impl Stepper {
        fn new(broken: Arc<AtomicBool>) -> Self {
            let action: Arc<dyn Action<Counter>> = Arc::new(Increment { broken });
            let table = ActionTable::new()
                .bind_to(0, action.clone(), 1)
                .bind_to(1, action, 2);
            Self { table }
        }
    }

    impl WorkflowType for Stepper {
        type State = u32;
        type Context = Counter;

        fn type_tag(&self) -> &str {
            "stepper"
        }

        fn actions(&self) -> &ActionTable<u32, Counter> {
            &self.table
        }

        fn resolve_state(&self, context: &Counter) -> u32 {
            context.step
        }

        fn on_action_complete(&self, _old: &u32, new: &u32, _outcome: &ActionOutcome, context: &mut Counter) {
            context.step = *new;
        }

        fn handle_exception(&self, context: &mut Counter, _error: &ActionError) {
            context.failures += 1;
        }
    }

    fn runner(broken: Arc<AtomicBool>, monitor: Arc<RecordingSink>) -> (WorkflowRunner, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let machine = WorkflowStateMachine::new(Stepper::new(broken)).unwrap();
        let runner = WorkflowRunner::new(store.clone(), monitor)
            .register(Arc::new(machine))
            .unwrap();
        (runner, store)
    }

    #[tokio::test]
    async fn test_runs_to_completion_and_archives() {
        let monitor = Arc::new(RecordingSink::new());
        let (runner, store) = runner(Arc::new(AtomicBool::new(false)), monitor.clone());
        let id = runner.create("stepper", &Counter::default()).await.unwrap();

        runner.run_once(&id).await.unwrap();
        runner.run_once(&id).await.unwrap();
        let last = runner.run_once(&id).await.unwrap();
        assert_eq!(last.outcome, DriveOutcome::Completed);

        let record = store.load_workflow(&id).await.unwrap().unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.current_step(), Some("2"));
        assert_eq!(record.version, 3);

        let after = runner.run_once(&id).await.unwrap();
        assert_eq!(after.outcome, DriveOutcome::Archived);
        assert_eq!(monitor.kinds().len(), 6);
    }

    #[tokio::test]
    async fn test_failed_step_is_saved_and_reported() {
        let broken = Arc::new(AtomicBool::new(true));
        let (runner, store) = runner(broken.clone(), Arc::new(RecordingSink::new()));
        let runner = runner.with_retry_delay(Duration::from_secs(60));
        let id = runner.create("stepper", &Counter::default()).await.unwrap();

        let err = runner.run_once(&id).await.unwrap_err();
        assert!(matches!(err, OpsflowError::ActionFailure { .. }));
        assert!(err.is_retryable());

        let record = store.load_workflow(&id).await.unwrap().unwrap();
        assert_eq!(record.context_as::<Counter>().unwrap().step, 0);
        assert_eq!(record.context_as::<Counter>().unwrap().failures, 1);
        assert_eq!(record.failed_attempts, 1);
        assert!(record.last_error.as_deref().unwrap().contains("disk full"));
        assert!(!record.is_due(Utc::now()));

        broken.store(false, Ordering::SeqCst);
        runner.run_once(&id).await.unwrap();
        let record = store.load_workflow(&id).await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_waiting_step_does_not_count_as_failure() {
        let (runner, store) = runner(Arc::new(AtomicBool::new(false)), Arc::new(RecordingSink::new()));
        let blocked = Counter {
            blocked: true,
            ..Default::default()
        };
        let id = runner.create("stepper", &blocked).await.unwrap();

        for _ in 0..3 {
            let report = runner.run_once(&id).await.unwrap();
            assert!(matches!(report.outcome, DriveOutcome::Failed { ref error, .. } if error.is_not_ready()));
        }

        let record = store.load_workflow(&id).await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
        assert!(record.last_error.as_deref().unwrap().contains("upstream busy"));
        assert_eq!(record.context_as::<Counter>().unwrap().step, 0);
    }

    #[tokio::test]
    async fn test_unknown_workflow_type_is_rejected() {
        let (runner, _) = runner(Arc::new(AtomicBool::new(false)), Arc::new(RecordingSink::new()));
        let err = runner.create("reindex", &Counter::default()).await.unwrap_err();
        assert!(matches!(err, OpsflowError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let broken = Arc::new(AtomicBool::new(false));
        let result = WorkflowRunner::new(store, Arc::new(RecordingSink::new()))
            .register(Arc::new(WorkflowStateMachine::new(Stepper::new(broken.clone())).unwrap()))
            .unwrap()
            .register(Arc::new(WorkflowStateMachine::new(Stepper::new(broken)).unwrap()));
        assert!(matches!(result, Err(OpsflowError::Configuration(_))));
    }
}
