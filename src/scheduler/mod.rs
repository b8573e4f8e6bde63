//! Job scheduler: the fixed-delay loop that drives everything
//!
//! Each scan does two things. Due workflow records are handed to the
//! [`WorkflowRunner`] on pooled tasks, at most one task per record, so a
//! step that waits on a valve never holds up the scan. Non-terminal jobs are
//! then walked through their lifecycle inline: dispatch, poll, timeout,
//! result collection, teardown. An error on one record is logged and the
//! scan moves on.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use crate::backend::{ExecutionService, JobRecord, JobStatus};
use crate::error::OpsflowError;
use crate::monitor::{job_span, LifecycleEvent, LifecycleKind, OperationTimer};
use crate::resource::ResourceState;
use crate::shutdown::ShutdownCoordinator;
use crate::store::StoreError;
use crate::workflow::WorkflowRunner;

/// Floor for the pause between scans; zero would spin.
const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Pause after one scan completes before the next begins.
    pub scan_interval_ms: u64,
    pub max_concurrent_workflows: usize,
    /// How long shutdown waits for in-flight workflow steps.
    pub shutdown_grace_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: 5_000,
            max_concurrent_workflows: 8,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl SchedulerSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms).max(MIN_SCAN_INTERVAL)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub workflows_started: usize,
    /// Due workflows left for a later scan because they were already running
    /// or the pool was full.
    pub workflows_skipped: usize,
    pub jobs_processed: usize,
    pub errors: usize,
}

/// Removes a workflow id from the in-flight set when its task ends, however
/// it ends.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

pub struct JobScheduler {
    runner: Arc<WorkflowRunner>,
    execution: Arc<ExecutionService>,
    settings: SchedulerSettings,
    pool: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl JobScheduler {
    pub fn new(runner: Arc<WorkflowRunner>, execution: Arc<ExecutionService>, settings: SchedulerSettings) -> Self {
        let permits = settings.max_concurrent_workflows.max(1);
        Self {
            runner,
            execution,
            settings,
            pool: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn runner(&self) -> &Arc<WorkflowRunner> {
        &self.runner
    }

    pub fn execution(&self) -> &Arc<ExecutionService> {
        &self.execution
    }

    /// Scan until shutdown is triggered, then wait for in-flight workflow
    /// steps up to the grace period.
    pub async fn run(&self, shutdown: ShutdownCoordinator) {
        info!(
            scan_interval_ms = self.settings.scan_interval_ms,
            max_concurrent_workflows = self.settings.max_concurrent_workflows,
            "Scheduler started"
        );

        while !shutdown.is_shutting_down() {
            let report = self.tick().await;
            if report.errors > 0 {
                warn!(errors = report.errors, "Scan finished with errors");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.scan_interval()) => {}
                _ = shutdown.wait() => break,
            }
        }

        info!("Scheduler stopping, waiting for in-flight workflows");
        shutdown
            .drain(self.settings.shutdown_grace(), self.wait_for_workflows())
            .await;
    }

    /// One full scan over due workflows and active jobs.
    pub async fn tick(&self) -> TickReport {
        let timer = OperationTimer::new("scheduler_scan");
        let mut report = TickReport::default();

        match self.runner.store().list_due_workflows(Utc::now()).await {
            Ok(due) => {
                for record in due {
                    if self.spawn_workflow(record.id) {
                        report.workflows_started += 1;
                    } else {
                        report.workflows_skipped += 1;
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to list due workflows");
                report.errors += 1;
            }
        }

        match self.execution.store().list_active_jobs().await {
            Ok(jobs) => {
                for job in jobs {
                    let job_id = job.id.clone();
                    let span = job_span(&job.id, &job.job_type);
                    match self.process_job(job).instrument(span).await {
                        Ok(()) => report.jobs_processed += 1,
                        Err(e) => {
                            report.errors += 1;
                            if e.is_retryable() {
                                warn!(job_id = %job_id, error = %e, "Job processing failed, will retry");
                            } else {
                                error!(job_id = %job_id, error = %e, "Job processing failed permanently");
                                self.fail_job(&job_id, &e).await;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to list active jobs");
                report.errors += 1;
            }
        }

        debug!(
            workflows_started = report.workflows_started,
            workflows_skipped = report.workflows_skipped,
            jobs_processed = report.jobs_processed,
            errors = report.errors,
            "Scan complete"
        );
        timer.finish();
        report
    }

    /// Resolve once no workflow step is running.
    pub async fn wait_for_workflows(&self) {
        let permits = self.settings.max_concurrent_workflows.max(1) as u32;
        // Only fails if the semaphore is closed, which never happens.
        let _ = self.pool.acquire_many(permits).await;
    }

    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, OpsflowError> {
        self.execution.cancel(job_id).await
    }

    fn spawn_workflow(&self, workflow_id: String) -> bool {
        let permit = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if in_flight.contains(&workflow_id) {
                debug!(workflow_id = %workflow_id, "Workflow step still running, skipping");
                return false;
            }
            let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() else {
                debug!(workflow_id = %workflow_id, "Workflow pool is full, deferring");
                return false;
            };
            in_flight.insert(workflow_id.clone());
            permit
        };

        let guard = InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id: workflow_id.clone(),
        };
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            match runner.run_once(&workflow_id).await {
                Ok(report) => debug!(workflow_id = %workflow_id, outcome = ?report.outcome, "Workflow step finished"),
                Err(e) if e.is_retryable() => {
                    warn!(workflow_id = %workflow_id, error = %e, "Workflow step failed, will retry")
                }
                Err(e) => error!(workflow_id = %workflow_id, error = %e, "Workflow step failed permanently"),
            }
        });
        true
    }

    async fn process_job(&self, mut job: JobRecord) -> Result<(), OpsflowError> {
        match job.status {
            JobStatus::Pending => {
                self.dispatch_job(&mut job).await?;
                if job.executor_id.is_some() {
                    return self.save_dispatched(job).await;
                }
            }
            JobStatus::Dispatched | JobStatus::Running | JobStatus::Cancelling => self.observe_job(&mut job).await?,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => return Ok(()),
        }
        self.execution.store().save_job(&mut job).await?;
        Ok(())
    }

    /// Record a freshly launched executor. The record may have changed while
    /// the launch was in flight: a cancel finishes a job that has no
    /// executor yet, so the launched executor must be torn down and the job
    /// tracked until it is gone.
    async fn save_dispatched(&self, mut job: JobRecord) -> Result<(), OpsflowError> {
        let store = self.execution.store();
        match store.save_job(&mut job).await {
            Err(StoreError::VersionConflict { .. }) => {}
            other => return Ok(other?),
        }

        let Some(mut current) = store.load_job(&job.id).await? else {
            warn!(job_id = %job.id, "Job vanished while dispatching, tearing down its executor");
            self.execution.terminate(&job).await?;
            return Ok(());
        };
        current.executor_id = job.executor_id.clone();
        current.dispatched_at = job.dispatched_at;

        if current.status == JobStatus::Pending {
            current.status = JobStatus::Dispatched;
            current.resource_state = job.resource_state;
            current.last_error = None;
        } else {
            warn!(job_id = %job.id, status = ?current.status, "Job changed while dispatching, tearing down its executor");
            current.resource_state = Some(self.execution.terminate(&current).await?);
            current.status = JobStatus::Cancelling;
            current.finished_at = None;
        }
        store.save_job(&mut current).await?;
        Ok(())
    }

    async fn dispatch_job(&self, job: &mut JobRecord) -> Result<(), OpsflowError> {
        match self.execution.dispatch(job).await {
            Ok(executor_id) => {
                job.executor_id = Some(executor_id);
                job.status = JobStatus::Dispatched;
                job.resource_state = Some(ResourceState::Creating);
                job.dispatched_at = Some(Utc::now());
                job.last_error = None;
            }
            Err(e) => {
                job.last_error = Some(e.to_string());
                let err = OpsflowError::from(e);
                if !err.is_retryable() {
                    return Err(err);
                }
                // Left Pending; the next scan dispatches again.
            }
        }
        Ok(())
    }

    async fn observe_job(&self, job: &mut JobRecord) -> Result<(), OpsflowError> {
        let Some(executor_id) = job.executor_id.clone() else {
            return Err(OpsflowError::configuration(format!(
                "job {} is {:?} but has no executor",
                job.id, job.status
            )));
        };
        let previous = job.resource_state.unwrap_or(ResourceState::Creating);
        let state = self.execution.poll_state(&executor_id, previous).await?;
        job.resource_state = Some(state);
        let cancelling = job.status == JobStatus::Cancelling;

        match state {
            ResourceState::Creating | ResourceState::Running => {
                if state == ResourceState::Running && !cancelling {
                    job.status = JobStatus::Running;
                }
                if !cancelling && job.is_overdue(Utc::now()) {
                    warn!(job_id = %job.id, timeout_secs = job.timeout_secs, "Job timed out, terminating");
                    job.last_error = Some(format!("timed out after {}s", job.timeout_secs));
                    job.resource_state = Some(self.execution.terminate(job).await?);
                    job.status = JobStatus::Cancelling;
                }
            }
            ResourceState::Destroying => {
                if previous != ResourceState::Destroying && !cancelling {
                    self.collect(job).await;
                    // Finished pods linger until deleted.
                    if let Err(e) = self.execution.terminate(job).await {
                        warn!(job_id = %job.id, error = %e, "Teardown request failed, will wait for the executor to go away");
                    }
                }
            }
            ResourceState::ErrorState => {
                if previous != ResourceState::ErrorState {
                    self.collect(job).await;
                    let reason = job
                        .result
                        .as_ref()
                        .and_then(|r| r.error.clone())
                        .unwrap_or_else(|| "executor reported an error".to_string());
                    warn!(job_id = %job.id, reason = %reason, "Job executor failed");
                    job.last_error.get_or_insert(reason);
                    if let Err(e) = self.execution.terminate(job).await {
                        warn!(job_id = %job.id, error = %e, "Teardown request failed");
                    }
                }
            }
            ResourceState::Destroyed => {
                if job.result.is_none() && !cancelling {
                    self.collect(job).await;
                }
                self.finish_job(job);
            }
            ResourceState::Unknown => {
                debug!(job_id = %job.id, "Lost contact with executor, retrying next scan");
            }
        }
        Ok(())
    }

    /// Best effort: a missing result is decided on at DESTROYED.
    async fn collect(&self, job: &mut JobRecord) {
        let Some(executor_id) = job.executor_id.as_ref() else {
            return;
        };
        match self.execution.collect_result(executor_id).await {
            Ok(Some(result)) => job.result = Some(result),
            Ok(None) => debug!(job_id = %job.id, "No result available yet"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to collect job result"),
        }
    }

    fn finish_job(&self, job: &mut JobRecord) {
        let succeeded = job.result.as_ref().is_some_and(|r| r.success) && job.last_error.is_none();
        let status = if job.status == JobStatus::Cancelling {
            JobStatus::Cancelled
        } else if succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        if status == JobStatus::Failed && job.last_error.is_none() {
            job.last_error = Some(
                job.result
                    .as_ref()
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "executor finished without a result".to_string()),
            );
        }
        job.finish(status);
        info!(job_id = %job.id, status = ?status, "Job finished");

        let monitor = self.execution.monitor();
        if status == JobStatus::Succeeded {
            monitor.emit(&LifecycleEvent::success(LifecycleKind::JobDestroy, &job.id, &job.job_type));
        } else {
            monitor.emit(&LifecycleEvent::failure(
                LifecycleKind::JobDestroy,
                &job.id,
                &job.job_type,
                job.last_error.clone().unwrap_or_default(),
            ));
        }
    }

    async fn fail_job(&self, job_id: &str, error: &OpsflowError) {
        let store = self.execution.store();
        let mut job = match store.load_job(job_id).await {
            Ok(Some(job)) if !job.status.is_terminal() => job,
            Ok(_) => return,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to load job to mark it failed");
                return;
            }
        };
        job.last_error = Some(error.to_string());
        job.finish(JobStatus::Failed);
        if let Err(e) = store.save_job(&mut job).await {
            error!(job_id = %job_id, error = %e, "Failed to mark job failed");
        }
    }
}
