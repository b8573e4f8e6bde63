//! Local process backend
//!
//! Spawns the worker binary on this host with `tokio::process`. The child
//! handle is kept so liveness and exit code can be observed; termination is
//! cooperative first (stop file) and forced after a grace period.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::context::CONTEXT_ENV;
use super::{BackendError, ExecutionBackend, ExecutorIdentifier, ExecutorKind, JobRecord, JobResult, Launch, WorkerPaths};
use crate::resource::ResourceEvent;

/// How the sealed context reaches the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTransport {
    File,
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProcessConfig {
    /// Program to run; usually the `opsflow` binary itself.
    pub worker_program: PathBuf,
    /// Arguments placed before `worker --context-file <path>`.
    #[serde(default)]
    pub worker_args: Vec<String>,
    /// Context, stop, result and log files live here.
    pub work_dir: PathBuf,
    pub context_transport: ContextTransport,
    pub termination_grace_ms: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for LocalProcessConfig {
    fn default() -> Self {
        Self {
            worker_program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("opsflow")),
            worker_args: Vec::new(),
            work_dir: std::env::temp_dir().join("opsflow"),
            context_transport: ContextTransport::File,
            termination_grace_ms: 10_000,
            env: HashMap::new(),
        }
    }
}

struct TrackedChild {
    child: Child,
    pid: Option<u32>,
    /// Set once the exit has been reported, so the next probe reports `Gone`.
    exit_reported: bool,
}

pub struct LocalProcessBackend {
    config: LocalProcessConfig,
    children: Arc<Mutex<HashMap<String, TrackedChild>>>,
}

impl LocalProcessBackend {
    pub fn new(config: LocalProcessConfig) -> Self {
        Self {
            config,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn file(&self, job_id: &str, suffix: &str) -> PathBuf {
        self.config.work_dir.join(format!("{job_id}.{suffix}"))
    }

    fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.config.termination_grace_ms)
    }

    /// Remove everything the job left in the work dir. Runs once the exit has
    /// been reported, after the result was collected.
    async fn cleanup_files(&self, job_id: &str) {
        for suffix in ["context", "stop", "result.json", "log"] {
            let path = self.file(job_id, suffix);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(file = ?path, error = %e, "Could not remove worker file");
                }
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalProcessBackend {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::LocalProcess
    }

    fn worker_paths(&self, job_id: &str) -> WorkerPaths {
        WorkerPaths {
            stop_path: self.file(job_id, "stop"),
            result_path: self.file(job_id, "result.json"),
        }
    }

    async fn dispatch(&self, job: &JobRecord, launch: &Launch) -> Result<ExecutorIdentifier, BackendError> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        let mut command = Command::new(&self.config.worker_program);
        command.args(&self.config.worker_args).arg("worker");

        match self.config.context_transport {
            ContextTransport::File => {
                let context_path = self.file(&job.id, "context");
                tokio::fs::write(&context_path, &launch.payload).await?;
                command.arg("--context-file").arg(&context_path);
            }
            ContextTransport::Env => {
                command.arg("--context-env").env(CONTEXT_ENV, &launch.payload);
            }
        }

        let log = tokio::fs::File::create(self.file(&job.id, "log")).await?.into_std().await;
        let log_err = log.try_clone()?;

        let child = command
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| BackendError::Spawn(format!("{}: {e}", self.config.worker_program.display())))?;

        let pid = child.id();
        info!(job_id = %job.id, pid = ?pid, "Spawned local worker process");

        self.children.lock().await.insert(
            job.id.clone(),
            TrackedChild {
                child,
                pid,
                exit_reported: false,
            },
        );

        Ok(ExecutorIdentifier::new(ExecutorKind::LocalProcess, job.id.clone()))
    }

    async fn probe(&self, id: &ExecutorIdentifier) -> Result<ResourceEvent, BackendError> {
        let mut children = self.children.lock().await;
        let Some(tracked) = children.get_mut(&id.handle) else {
            // Not spawned by this scheduler instance, or already reaped.
            debug!(executor = %id, "Process not tracked, reporting gone");
            return Ok(ResourceEvent::Gone);
        };

        if tracked.exit_reported {
            children.remove(&id.handle);
            drop(children);
            self.cleanup_files(&id.handle).await;
            return Ok(ResourceEvent::Gone);
        }

        match tracked.child.try_wait()? {
            None => Ok(ResourceEvent::Started),
            Some(status) => {
                tracked.exit_reported = true;
                debug!(executor = %id, pid = ?tracked.pid, status = %status, "Worker process exited");
                if status.success() {
                    Ok(ResourceEvent::Completed)
                } else {
                    Ok(ResourceEvent::Failed {
                        reason: format!("worker exited with {status}"),
                    })
                }
            }
        }
    }

    async fn request_termination(&self, id: &ExecutorIdentifier) -> Result<(), BackendError> {
        let paths = self.worker_paths(&id.handle);
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        tokio::fs::write(&paths.stop_path, b"stop").await?;
        info!(executor = %id, "Requested cooperative stop");

        if !self.children.lock().await.contains_key(&id.handle) {
            return Ok(());
        }

        let children = Arc::clone(&self.children);
        let handle = id.handle.clone();
        let grace = self.termination_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut children = children.lock().await;
            if let Some(tracked) = children.get_mut(&handle) {
                if matches!(tracked.child.try_wait(), Ok(None)) {
                    warn!(job_id = %handle, pid = ?tracked.pid, grace_ms = grace.as_millis() as u64, "Worker ignored stop request, killing");
                    if let Err(e) = tracked.child.start_kill() {
                        warn!(job_id = %handle, error = %e, "Failed to kill worker process");
                    }
                }
            }
        });

        Ok(())
    }

    async fn collect_result(&self, id: &ExecutorIdentifier) -> Result<Option<JobResult>, BackendError> {
        read_result_file(&self.worker_paths(&id.handle).result_path).await
    }
}

async fn read_result_file(path: &Path) -> Result<Option<JobResult>, BackendError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
