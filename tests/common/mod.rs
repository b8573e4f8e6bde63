//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use opsflow::backend::{
    BackendError, ExecutionBackend, ExecutionService, ExecutorIdentifier, ExecutorKind, JobRecord, JobResult,
    JobTypeRegistry, JobTypeSpec, Launch, WorkerPaths,
};
use opsflow::migration::{MigrationPlan, MigrationService, MigrationServiceError, StepResult};
use opsflow::monitor::RecordingSink;
use opsflow::store::JobStore;
use opsflow::ResourceEvent;

/// Backend whose executors start on the first probe, finish on the second
/// and disappear on the third.
#[derive(Default)]
pub struct FakeBackend {
    probes: Mutex<HashMap<String, usize>>,
    pub rows_copied: u64,
    pub terminations: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(rows_copied: u64) -> Self {
        Self {
            rows_copied,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Pod
    }

    fn worker_paths(&self, job_id: &str) -> WorkerPaths {
        WorkerPaths {
            stop_path: PathBuf::from(format!("/var/run/opsflow/{job_id}.stop")),
            result_path: PathBuf::from(format!("/var/run/opsflow/{job_id}.result.json")),
        }
    }

    async fn dispatch(&self, job: &JobRecord, _launch: &Launch) -> Result<ExecutorIdentifier, BackendError> {
        Ok(ExecutorIdentifier::new(ExecutorKind::Pod, format!("ops/{}", job.id)))
    }

    async fn probe(&self, id: &ExecutorIdentifier) -> Result<ResourceEvent, BackendError> {
        let mut probes = self.probes.lock().unwrap();
        let seen = probes.entry(id.handle.clone()).or_insert(0);
        *seen += 1;
        Ok(match *seen {
            1 => ResourceEvent::Started,
            2 => ResourceEvent::Completed,
            _ => ResourceEvent::Gone,
        })
    }

    async fn request_termination(&self, id: &ExecutorIdentifier) -> Result<(), BackendError> {
        self.terminations.lock().unwrap().push(id.handle.clone());
        Ok(())
    }

    async fn collect_result(&self, id: &ExecutorIdentifier) -> Result<Option<JobResult>, BackendError> {
        let job_id = id.handle.trim_start_matches("ops/");
        Ok(Some(JobResult::succeeded(
            job_id,
            serde_json::json!({ "rows_copied": self.rows_copied }),
        )))
    }
}

/// Migration service that records calls and reports a configurable
/// replication lag.
#[derive(Default)]
pub struct FakeMigrationService {
    pub lag_secs: Mutex<i64>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeMigrationService {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MigrationService for FakeMigrationService {
    async fn start_migration(&self, plan: &MigrationPlan) -> Result<String, MigrationServiceError> {
        self.record(format!("start {}", plan.table));
        Ok(format!("mig-{}", plan.table))
    }

    async fn step_result(&self, _migration_id: &str) -> Result<StepResult, MigrationServiceError> {
        let lag = *self.lag_secs.lock().unwrap();
        Ok(StepResult {
            checkpoint: Some(Utc::now().timestamp() - lag),
            rows_replicated: 0,
        })
    }

    async fn cut_over(&self, migration_id: &str) -> Result<(), MigrationServiceError> {
        self.record(format!("cut_over {migration_id}"));
        Ok(())
    }

    async fn abort_cutover(&self, migration_id: &str) -> Result<(), MigrationServiceError> {
        self.record(format!("abort_cutover {migration_id}"));
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), MigrationServiceError> {
        self.record(format!("drop {table}"));
        Ok(())
    }
}

pub fn job_types() -> JobTypeRegistry {
    JobTypeRegistry::new().register(JobTypeSpec::new("backfill", ExecutorKind::Pod, Duration::from_secs(3600)))
}

pub fn execution(store: Arc<dyn JobStore>, backend: Arc<FakeBackend>, monitor: Arc<RecordingSink>) -> Arc<ExecutionService> {
    Arc::new(ExecutionService::new(job_types(), store, monitor).with_backend(backend))
}
