use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::{
    BackendError, ContextCodec, ExecutionBackend, ExecutorIdentifier, ExecutorKind, JobContext, JobDefinition,
    JobRecord, JobResult, JobStatus, JobTypeRegistry, Launch,
};
use crate::error::OpsflowError;
use crate::monitor::{LifecycleEvent, LifecycleKind, MonitoringSink};
use crate::resource::{ResourceEvent, ResourceLifecycle, ResourceState};
use crate::store::{JobStore, StoreError};
use crate::transition::TransitionValidator;

/// Job properties with this prefix are passed to the worker as connection
/// settings, prefix stripped.
const CONNECTION_PREFIX: &str = "connection.";

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub dispatch_timeout: Duration,
    pub stop_check_interval: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(60),
            stop_check_interval: Duration::from_secs(5),
        }
    }
}

/// Submits jobs and talks to whichever backend runs them.
///
/// Backends are looked up by [`ExecutorKind`] in a map fixed at construction;
/// every native status a backend reports goes through the canonical
/// [`ResourceLifecycle`] before anyone sees it.
pub struct ExecutionService {
    backends: HashMap<ExecutorKind, Arc<dyn ExecutionBackend>>,
    job_types: JobTypeRegistry,
    store: Arc<dyn JobStore>,
    monitor: Arc<dyn MonitoringSink>,
    codec: ContextCodec,
    lifecycle: ResourceLifecycle,
    settings: ExecutionSettings,
    dispatcher: String,
}

impl ExecutionService {
    pub fn new(job_types: JobTypeRegistry, store: Arc<dyn JobStore>, monitor: Arc<dyn MonitoringSink>) -> Self {
        Self {
            backends: HashMap::new(),
            job_types,
            store,
            monitor,
            codec: ContextCodec::plain(),
            lifecycle: ResourceLifecycle::canonical(),
            settings: ExecutionSettings::default(),
            dispatcher: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown-host".to_string()),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn with_codec(mut self, codec: ContextCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<dyn MonitoringSink> {
        &self.monitor
    }

    fn backend(&self, kind: ExecutorKind) -> Result<&Arc<dyn ExecutionBackend>, BackendError> {
        self.backends
            .get(&kind)
            .ok_or(BackendError::UnsupportedExecutor(kind))
    }

    /// Validate and persist a job as `Pending`; the scheduler dispatches it
    /// on its next tick. Submitting a definition with a fixed id that is
    /// already stored returns that id and changes nothing.
    pub async fn submit(&self, definition: JobDefinition) -> Result<String, OpsflowError> {
        let record = self.job_types.resolve(definition)?;
        self.backend(record.executor)?;
        match self.store.insert_job(&record).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(id)) => {
                info!(job_id = %id, "Job already submitted");
                return Ok(id);
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            job_id = %record.id,
            job_type = %record.job_type,
            executor = %record.executor,
            timeout_secs = record.timeout_secs,
            "Job submitted"
        );
        Ok(record.id)
    }

    fn build_context(&self, job: &JobRecord, backend: &dyn ExecutionBackend) -> JobContext {
        let paths = backend.worker_paths(&job.id);
        let connection = job
            .properties
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(CONNECTION_PREFIX)
                    .map(|key| (key.to_string(), v.clone()))
            })
            .collect();

        JobContext {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            parameters: job.parameters.clone(),
            worker_id: format!("{}/{}", job.executor, job.id),
            dispatcher: self.dispatcher.clone(),
            connection,
            stop_path: paths.stop_path,
            result_path: paths.result_path,
            stop_check_interval_ms: self.settings.stop_check_interval.as_millis() as u64,
            issued_at: Utc::now(),
        }
    }

    /// Launch the job's worker. Bounded by the dispatch timeout.
    pub async fn dispatch(&self, job: &JobRecord) -> Result<ExecutorIdentifier, BackendError> {
        let result = self.try_dispatch(job).await;
        match &result {
            Ok(id) => {
                info!(job_id = %job.id, executor = %id, "Job dispatched");
                self.monitor
                    .emit(&LifecycleEvent::success(LifecycleKind::JobStart, &job.id, &job.job_type));
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job dispatch failed");
                self.monitor.emit(&LifecycleEvent::failure(
                    LifecycleKind::JobStart,
                    &job.id,
                    &job.job_type,
                    e.to_string(),
                ));
            }
        }
        result
    }

    async fn try_dispatch(&self, job: &JobRecord) -> Result<ExecutorIdentifier, BackendError> {
        let backend = self.backend(job.executor)?;
        let context = self.build_context(job, backend.as_ref());
        let payload = self.codec.seal(&context)?;
        let launch = Launch { context, payload };

        let timeout = self.settings.dispatch_timeout;
        tokio::time::timeout(timeout, backend.dispatch(job, &launch))
            .await
            .map_err(|_| BackendError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Observe the executor and fold the observation into the canonical
    /// lifecycle. A failed probe means communication was lost, so the state
    /// becomes `UNKNOWN` rather than an error.
    pub async fn poll_state(&self, id: &ExecutorIdentifier, last_known: ResourceState) -> Result<ResourceState, OpsflowError> {
        if last_known.is_terminal() {
            return Ok(last_known);
        }
        let backend = self.backend(id.kind)?;

        let event = match backend.probe(id).await {
            Ok(event) => event,
            Err(e) => {
                warn!(executor = %id, error = %e, "Probe failed");
                ResourceEvent::CommunicationLost { reason: e.to_string() }
            }
        };

        match self.lifecycle.next(&event, &last_known) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(
                    executor = %id,
                    state = %last_known,
                    event = ?event,
                    error = %e,
                    "Observation does not fit the resource lifecycle, keeping last known state"
                );
                Ok(last_known)
            }
        }
    }

    /// Request teardown. The executor may keep running for a while; the
    /// returned `DESTROYING` is confirmed as `DESTROYED` only by a later poll.
    pub async fn terminate(&self, job: &JobRecord) -> Result<ResourceState, OpsflowError> {
        let id = job
            .executor_id
            .as_ref()
            .ok_or_else(|| BackendError::InvalidHandle(format!("job {} was never dispatched", job.id)))?;

        match self.backend(id.kind)?.request_termination(id).await {
            Ok(()) => {
                self.monitor
                    .emit(&LifecycleEvent::success(LifecycleKind::JobStop, &job.id, &job.job_type));
                Ok(ResourceState::Destroying)
            }
            Err(e) => {
                self.monitor.emit(&LifecycleEvent::failure(
                    LifecycleKind::JobStop,
                    &job.id,
                    &job.job_type,
                    e.to_string(),
                ));
                Err(e.into())
            }
        }
    }

    pub async fn collect_result(&self, id: &ExecutorIdentifier) -> Result<Option<JobResult>, OpsflowError> {
        Ok(self.backend(id.kind)?.collect_result(id).await?)
    }

    /// Mark a job `Cancelling` and request teardown. A job that was never
    /// dispatched is cancelled outright.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, OpsflowError> {
        let mut job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| OpsflowError::configuration(format!("unknown job '{job_id}'")))?;

        if job.status.is_terminal() || job.status == JobStatus::Cancelling {
            return Ok(job.status);
        }

        if job.executor_id.is_none() {
            job.finish(JobStatus::Cancelled);
        } else {
            job.resource_state = Some(self.terminate(&job).await?);
            job.status = JobStatus::Cancelling;
        }
        self.store.save_job(&mut job).await?;
        info!(job_id = %job.id, status = ?job.status, "Job cancellation requested");
        Ok(job.status)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::job::JobTypeSpec;
    use crate::backend::WorkerPaths;
    use crate::monitor::{EventOutcome, RecordingSink};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Backend whose probes replay a script.
    #[derive(Default)]
    pub(crate) struct ScriptedBackend {
        pub probes: Mutex<VecDeque<Result<ResourceEvent, String>>>,
        pub dispatch_delay: Option<Duration>,
        pub launches: Mutex<Vec<Launch>>,
        pub terminations: Mutex<usize>,
    }

    impl ScriptedBackend {
        pub(crate) fn with_probes(probes: Vec<Result<ResourceEvent, String>>) -> Self {
            Self {
                probes: Mutex::new(probes.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ExecutionBackend for ScriptedBackend {
        fn kind(&self) -> ExecutorKind {
            ExecutorKind::LocalProcess
        }

        fn worker_paths(&self, job_id: &str) -> WorkerPaths {
            WorkerPaths {
                stop_path: PathBuf::from(format!("/run/{job_id}.stop")),
                result_path: PathBuf::from(format!("/run/{job_id}.result.json")),
            }
        }

        async fn dispatch(&self, job: &JobRecord, launch: &Launch) -> Result<ExecutorIdentifier, BackendError> {
            if let Some(delay) = self.dispatch_delay {
                tokio::time::sleep(delay).await;
            }
            self.launches.lock().unwrap().push(launch.clone());
            Ok(ExecutorIdentifier::new(ExecutorKind::LocalProcess, job.id.clone()))
        }

        async fn probe(&self, _id: &ExecutorIdentifier) -> Result<ResourceEvent, BackendError> {
            match self.probes.lock().unwrap().pop_front() {
                Some(Ok(event)) => Ok(event),
                Some(Err(reason)) => Err(BackendError::Rejected(reason)),
                None => Ok(ResourceEvent::Gone),
            }
        }

        async fn request_termination(&self, _id: &ExecutorIdentifier) -> Result<(), BackendError> {
            *self.terminations.lock().unwrap() += 1;
            Ok(())
        }

        async fn collect_result(&self, id: &ExecutorIdentifier) -> Result<Option<JobResult>, BackendError> {
            Ok(Some(JobResult::succeeded(&id.handle, serde_json::json!({ "rows": 1 }))))
        }
    }

    fn service(backend: Arc<ScriptedBackend>, monitor: Arc<RecordingSink>) -> ExecutionService {
        let job_types = JobTypeRegistry::new().register(JobTypeSpec::new(
            "backfill",
            ExecutorKind::LocalProcess,
            Duration::from_secs(600),
        ));
        ExecutionService::new(job_types, Arc::new(InMemoryStore::new()), monitor).with_backend(backend)
    }

    async fn submitted(service: &ExecutionService) -> JobRecord {
        let id = service
            .submit(
                JobDefinition::new("backfill", serde_json::json!({ "table": "users" }))
                    .with_property("connection.dsn", "postgres://db/app"),
            )
            .await
            .unwrap();
        service.store().load_job(&id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_submit_persists_pending_job() {
        let service = service(Arc::new(ScriptedBackend::default()), Arc::new(RecordingSink::new()));
        let job = submitted(&service).await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.version, 0);
    }

    #[tokio::test]
    async fn test_resubmitting_fixed_id_keeps_one_job() {
        let service = service(Arc::new(ScriptedBackend::default()), Arc::new(RecordingSink::new()));
        let definition = JobDefinition::new("backfill", serde_json::Value::Null).with_id("mig-1-backfill-0");

        let first = service.submit(definition.clone()).await.unwrap();
        let second = service.submit(definition).await.unwrap();

        assert_eq!(first, "mig-1-backfill-0");
        assert_eq!(second, first);
        assert_eq!(service.store().list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_executor_without_backend() {
        let service = service(Arc::new(ScriptedBackend::default()), Arc::new(RecordingSink::new()));
        let err = service
            .submit(JobDefinition::new("backfill", serde_json::Value::Null).on(ExecutorKind::Pod))
            .await
            .unwrap_err();
        assert!(matches!(err, OpsflowError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_dispatch_seals_context_with_backend_paths() {
        let backend = Arc::new(ScriptedBackend::default());
        let monitor = Arc::new(RecordingSink::new());
        let service = service(backend.clone(), monitor.clone());
        let job = submitted(&service).await;

        service.dispatch(&job).await.unwrap();

        let launch = backend.launches.lock().unwrap()[0].clone();
        let opened = ContextCodec::plain().open(&launch.payload).unwrap();
        assert_eq!(opened.job_id, job.id);
        assert_eq!(opened.connection.get("dsn").map(String::as_str), Some("postgres://db/app"));
        assert_eq!(opened.stop_path, PathBuf::from(format!("/run/{}.stop", job.id)));
        assert_eq!(monitor.kinds(), vec![LifecycleKind::JobStart]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_is_bounded_by_timeout() {
        let backend = Arc::new(ScriptedBackend {
            dispatch_delay: Some(Duration::from_secs(120)),
            ..Default::default()
        });
        let monitor = Arc::new(RecordingSink::new());
        let service = service(backend, monitor.clone()).with_settings(ExecutionSettings {
            dispatch_timeout: Duration::from_secs(5),
            stop_check_interval: Duration::from_secs(1),
        });
        let job = submitted(&service).await;

        let err = service.dispatch(&job).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { timeout_ms: 5000 }));
        assert_eq!(monitor.events()[0].outcome, EventOutcome::Failure);
    }

    #[tokio::test]
    async fn test_poll_walks_canonical_lifecycle() {
        let backend = Arc::new(ScriptedBackend::with_probes(vec![
            Ok(ResourceEvent::Provisioning),
            Ok(ResourceEvent::Started),
            Err("connection reset".to_string()),
            Ok(ResourceEvent::Started),
            Ok(ResourceEvent::Completed),
            Ok(ResourceEvent::Gone),
        ]));
        let service = service(backend, Arc::new(RecordingSink::new()));
        let id = ExecutorIdentifier::new(ExecutorKind::LocalProcess, "job-1");

        let mut state = ResourceState::Creating;
        let mut seen = Vec::new();
        for _ in 0..6 {
            state = service.poll_state(&id, state).await.unwrap();
            seen.push(state);
        }

        assert_eq!(
            seen,
            vec![
                ResourceState::Creating,
                ResourceState::Running,
                ResourceState::Unknown,
                ResourceState::Running,
                ResourceState::Destroying,
                ResourceState::Destroyed,
            ]
        );
    }

    #[tokio::test]
    async fn test_destroyed_is_returned_without_probing() {
        let backend = Arc::new(ScriptedBackend::with_probes(vec![Ok(ResourceEvent::Started)]));
        let service = service(backend.clone(), Arc::new(RecordingSink::new()));
        let id = ExecutorIdentifier::new(ExecutorKind::LocalProcess, "job-1");

        let state = service.poll_state(&id, ResourceState::Destroyed).await.unwrap();
        assert_eq!(state, ResourceState::Destroyed);
        assert_eq!(backend.probes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_impossible_observation_keeps_last_state() {
        let backend = Arc::new(ScriptedBackend::with_probes(vec![Ok(ResourceEvent::Provisioning)]));
        let service = service(backend, Arc::new(RecordingSink::new()));
        let id = ExecutorIdentifier::new(ExecutorKind::LocalProcess, "job-1");

        let state = service.poll_state(&id, ResourceState::Running).await.unwrap();
        assert_eq!(state, ResourceState::Running);
    }

    #[tokio::test]
    async fn test_cancel_dispatched_job_requests_teardown() {
        let backend = Arc::new(ScriptedBackend::default());
        let monitor = Arc::new(RecordingSink::new());
        let service = service(backend.clone(), monitor.clone());
        let mut job = submitted(&service).await;
        job.executor_id = Some(service.dispatch(&job).await.unwrap());
        job.status = JobStatus::Running;
        service.store().save_job(&mut job).await.unwrap();

        let status = service.cancel(&job.id).await.unwrap();

        assert_eq!(status, JobStatus::Cancelling);
        assert_eq!(*backend.terminations.lock().unwrap(), 1);
        let stored = service.store().load_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.resource_state, Some(ResourceState::Destroying));
        assert_eq!(monitor.kinds(), vec![LifecycleKind::JobStart, LifecycleKind::JobStop]);
    }

    #[tokio::test]
    async fn test_cancel_pending_job_skips_backend() {
        let backend = Arc::new(ScriptedBackend::default());
        let service = service(backend.clone(), Arc::new(RecordingSink::new()));
        let job = submitted(&service).await;

        assert_eq!(service.cancel(&job.id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(*backend.terminations.lock().unwrap(), 0);
    }
}
