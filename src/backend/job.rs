use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ExecutorIdentifier, ExecutorKind};
use crate::error::OpsflowError;
use crate::resource::ResourceState;

/// What a caller asks for. Unset fields are filled from the job type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Fixed id, for callers that must submit idempotently. A fresh id is
    /// generated when unset.
    #[serde(default)]
    pub id: Option<String>,
    pub job_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub executor: Option<ExecutorKind>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Backend-specific settings, e.g. `image` or `namespace` for pods.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl JobDefinition {
    pub fn new(job_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            parameters,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn on(mut self, executor: ExecutorKind) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Persisted, waiting for the next scheduler tick to dispatch it.
    Pending,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    /// Teardown requested; waiting for the resource to be DESTROYED.
    Cancelling,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Prefix of the stdout line carrying a worker's result, for backends that
/// can only read logs.
pub const RESULT_MARKER: &str = "OPSFLOW_RESULT";

/// What a worker reports when it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn succeeded(job_id: &str, output: serde_json::Value) -> Self {
        Self {
            job_id: job_id.to_string(),
            success: true,
            output,
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(job_id: &str, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }

    pub fn marker_line(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{RESULT_MARKER} {}", serde_json::to_string(self)?))
    }

    /// The last well-formed result line in `log`, if any.
    pub fn from_log(log: &str) -> Option<Self> {
        log.lines()
            .rev()
            .filter_map(|line| line.trim().strip_prefix(RESULT_MARKER))
            .find_map(|payload| serde_json::from_str(payload.trim()).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub job_type: String,
    pub parameters: serde_json::Value,
    pub executor: ExecutorKind,
    pub timeout_secs: u64,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    pub status: JobStatus,
    pub executor_id: Option<ExecutorIdentifier>,
    pub resource_state: Option<ResourceState>,
    pub result: Option<JobResult>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl JobRecord {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// True once the job has been running for longer than its timeout. A
    /// timeout too large for a `chrono` duration never expires.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        let Some(started) = self.dispatched_at else {
            return false;
        };
        let limit = i64::try_from(self.timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds);
        match limit {
            Some(limit) => now.signed_duration_since(started) > limit,
            None => false,
        }
    }

    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone)]
pub struct JobTypeSpec {
    pub name: String,
    pub default_executor: ExecutorKind,
    pub default_timeout: Duration,
}

impl JobTypeSpec {
    pub fn new(name: impl Into<String>, default_executor: ExecutorKind, default_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            default_executor,
            default_timeout,
        }
    }
}

/// Job types the scheduler accepts. Built at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct JobTypeRegistry {
    types: HashMap<String, JobTypeSpec>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, spec: JobTypeSpec) -> Self {
        self.types.insert(spec.name.clone(), spec);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<&JobTypeSpec> {
        self.types.get(job_type)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validate `definition` and turn it into a `Pending` record.
    pub fn resolve(&self, definition: JobDefinition) -> Result<JobRecord, OpsflowError> {
        let spec = self.get(&definition.job_type).ok_or_else(|| {
            OpsflowError::configuration(format!(
                "unknown job type '{}' (registered: {})",
                definition.job_type,
                self.names().join(", ")
            ))
        })?;

        Ok(JobRecord {
            id: definition.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            job_type: definition.job_type,
            parameters: definition.parameters,
            executor: definition.executor.unwrap_or(spec.default_executor),
            timeout_secs: definition
                .timeout_secs
                .unwrap_or(spec.default_timeout.as_secs()),
            properties: definition.properties,
            status: JobStatus::Pending,
            executor_id: None,
            resource_state: None,
            result: None,
            last_error: None,
            created_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
            version: 0,
        })
    }
}
