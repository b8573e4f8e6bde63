//! Job execution backends
//!
//! A backend launches a job's worker somewhere (a host process, a pod), probes
//! it, tears it down and fetches its result. Backends speak only in
//! [`ResourceEvent`]s; [`service::ExecutionService`] owns the canonical
//! lifecycle table and the dispatch map keyed by [`ExecutorKind`].

pub mod command;
pub mod context;
pub mod job;
pub mod local;
pub mod pod;
pub mod service;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::ResourceEvent;

pub use command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};
pub use context::{ContextCodec, ContextError, ContextKey, ContextSource, JobContext};
pub use job::{JobDefinition, JobRecord, JobResult, JobStatus, JobTypeRegistry, JobTypeSpec};
pub use local::{ContextTransport, LocalProcessBackend, LocalProcessConfig};
pub use pod::{PodBackend, PodConfig};
pub use service::ExecutionService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    LocalProcess,
    Pod,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::LocalProcess => write!(f, "local_process"),
            ExecutorKind::Pod => write!(f, "pod"),
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_process" | "local" | "process" => Ok(ExecutorKind::LocalProcess),
            "pod" | "kubernetes" | "k8s" => Ok(ExecutorKind::Pod),
            other => Err(BackendError::InvalidHandle(format!("unknown executor kind '{other}'"))),
        }
    }
}

/// Opaque handle correlating a job with its remote process or pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorIdentifier {
    pub kind: ExecutorKind,
    /// Job id for local processes, `<namespace>/<pod name>` for pods.
    pub handle: String,
}

impl ExecutorIdentifier {
    pub fn new(kind: ExecutorKind, handle: impl Into<String>) -> Self {
        Self {
            kind,
            handle: handle.into(),
        }
    }
}

impl fmt::Display for ExecutorIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.handle)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("No backend registered for executor kind {0}")]
    UnsupportedExecutor(ExecutorKind),

    #[error("Invalid executor handle: {0}")]
    InvalidHandle(String),

    #[error("Backend operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Failed to launch worker: {0}")]
    Spawn(String),

    #[error("Backend rejected request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job context error: {0}")]
    Context(#[from] ContextError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where a worker launched by a backend looks for its stop signal and
/// writes its result, as seen from inside the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPaths {
    pub stop_path: PathBuf,
    pub result_path: PathBuf,
}

/// Everything a backend needs to start one worker: the context itself (for
/// the paths it names) and its sealed, transport-ready form.
#[derive(Debug, Clone)]
pub struct Launch {
    pub context: JobContext,
    pub payload: String,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    fn worker_paths(&self, job_id: &str) -> WorkerPaths;

    async fn dispatch(&self, job: &JobRecord, launch: &Launch) -> Result<ExecutorIdentifier, BackendError>;

    /// Report what the backend currently sees. Communication failures are
    /// returned as errors; the caller maps them onto the lifecycle.
    async fn probe(&self, id: &ExecutorIdentifier) -> Result<ResourceEvent, BackendError>;

    /// Ask the executor to stop. Returning does not mean it has stopped.
    async fn request_termination(&self, id: &ExecutorIdentifier) -> Result<(), BackendError>;

    /// The worker's result, if it has written one.
    async fn collect_result(&self, id: &ExecutorIdentifier) -> Result<Option<JobResult>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_kind_parses_aliases() {
        assert_eq!("local".parse::<ExecutorKind>().unwrap(), ExecutorKind::LocalProcess);
        assert_eq!("k8s".parse::<ExecutorKind>().unwrap(), ExecutorKind::Pod);
        assert!("lambda".parse::<ExecutorKind>().is_err());
    }

    #[test]
    fn test_identifier_display() {
        let id = ExecutorIdentifier::new(ExecutorKind::Pod, "opsflow-job-1");
        assert_eq!(id.to_string(), "pod:opsflow-job-1");
    }
}
