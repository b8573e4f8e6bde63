//! Worker runtime: the out-of-process side of a job
//!
//! A worker loads its [`JobContext`], runs the handler registered for the
//! job type while honouring the [`StopSignal`], then writes a [`JobResult`]
//! to the result path and prints it on a marked stdout line.

pub mod handlers;
pub mod stop;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::{ContextCodec, ContextError, ContextSource, JobContext, JobResult};

pub use handlers::{ShellHandler, SleepHandler};
pub use stop::StopSignal;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job context error: {0}")]
    Context(#[from] ContextError),

    #[error("No handler registered for job type '{0}'")]
    UnknownJobType(String),

    #[error("Invalid job parameters: {0}")]
    InvalidParameters(String),

    #[error("Stopped before completion")]
    Interrupted,

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    /// Do the work. Long-running handlers must return
    /// [`WorkerError::Interrupted`] soon after `stop` is raised.
    async fn run(&self, context: &JobContext, stop: &StopSignal) -> Result<serde_json::Value, WorkerError>;
}

#[derive(Default, Clone)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `shell` and `sleep`.
    pub fn with_builtins() -> Self {
        Self::new()
            .register(Arc::new(ShellHandler))
            .register(Arc::new(SleepHandler))
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type().to_string(), handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Result<&Arc<dyn JobHandler>, WorkerError> {
        self.handlers
            .get(job_type)
            .ok_or_else(|| WorkerError::UnknownJobType(job_type.to_string()))
    }
}

/// Run the handler for an already-loaded context and turn its outcome into
/// a result. Never fails: every handler error becomes a failed result.
pub async fn execute(context: &JobContext, registry: &JobHandlerRegistry, stop: &StopSignal) -> JobResult {
    let handler = match registry.get(&context.job_type) {
        Ok(handler) => handler,
        Err(e) => return JobResult::failed(&context.job_id, e.to_string()),
    };

    if stop.is_stopped() {
        return JobResult::failed(&context.job_id, WorkerError::Interrupted.to_string());
    }

    match handler.run(context, stop).await {
        Ok(output) => {
            info!(job_id = %context.job_id, "Job handler finished");
            JobResult::succeeded(&context.job_id, output)
        }
        Err(WorkerError::Interrupted) => {
            warn!(job_id = %context.job_id, "Job handler stopped on request");
            JobResult::failed(&context.job_id, WorkerError::Interrupted.to_string())
        }
        Err(e) => {
            error!(job_id = %context.job_id, error = %e, "Job handler failed");
            JobResult::failed(&context.job_id, e.to_string())
        }
    }
}

async fn write_result(path: &Path, result: &JobResult) -> Result<(), WorkerError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, serde_json::to_vec_pretty(result)?).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Worker entry point: load the context, run the job, publish the result.
pub async fn run_worker(
    source: &ContextSource,
    codec: &ContextCodec,
    registry: &JobHandlerRegistry,
) -> Result<JobResult, WorkerError> {
    let context = source.load(codec).await?;
    info!(
        job_id = %context.job_id,
        job_type = %context.job_type,
        worker_id = %context.worker_id,
        stop_check_interval_ms = context.stop_check_interval_ms,
        "Worker started"
    );

    let stop = StopSignal::new(Some(context.stop_path.clone()), context.stop_check_interval());
    stop.listen_for_sigterm()?;

    let result = execute(&context, registry, &stop).await;

    if let Err(e) = write_result(&context.result_path, &result).await {
        // The marker line below still carries the result.
        warn!(job_id = %context.job_id, file = ?context.result_path, error = %e, "Could not write result file");
    }
    println!("{}", result.marker_line()?);

    Ok(result)
}
