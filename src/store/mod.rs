//! Persistence collaborator for workflow and job records
//!
//! Every save is a compare-and-swap on the record's `version`: the caller
//! passes the record as it loaded it, the store checks that nobody else has
//! written since, then bumps the version. A lost race surfaces as
//! [`StoreError::VersionConflict`] and the caller simply retries next tick.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::backend::JobRecord;
use crate::workflow::WorkflowRecord;

pub use fs::FileSystemStore;
pub use memory::InMemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid record id: {0:?}")]
    InvalidId(String),

    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict { id: String, expected: u64, found: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock acquisition failed: {reason}")]
    Lock { reason: String },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::Io(_) | StoreError::Lock { .. }
        )
    }
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError>;

    async fn load_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError>;

    /// Persist `record` if the stored version still equals `record.version`,
    /// then advance `record.version`.
    async fn save_workflow(&self, record: &mut WorkflowRecord) -> Result<(), StoreError>;

    /// Active records whose `next_run_at` has passed.
    async fn list_due_workflows(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowRecord>, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError>;

    async fn load_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Same compare-and-swap contract as [`WorkflowStore::save_workflow`].
    async fn save_job(&self, record: &mut JobRecord) -> Result<(), StoreError>;

    /// Jobs whose status is not terminal.
    async fn list_active_jobs(&self) -> Result<Vec<JobRecord>, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, StoreError>;
}

/// Both record kinds behind one handle, which is what the scheduler holds.
pub trait Store: WorkflowStore + JobStore {}

impl<T: WorkflowStore + JobStore> Store for T {}

/// Record ids become file names, so they must be a single plain path
/// component.
pub(crate) fn check_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\', ':', '\0']) {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

pub(crate) fn check_version(id: &str, expected: u64, found: u64) -> Result<(), StoreError> {
    if expected != found {
        return Err(StoreError::VersionConflict {
            id: id.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}
