//! Live table migration
//!
//! A [`workflow::MigrationWorkflow`] moves a table to a new schema with
//! near-zero downtime: the external migration service creates a shadow table
//! and replicates writes into it, a backfill job copies existing rows, and
//! the cut over only happens once the service's replication checkpoint is
//! fresh enough that no in-flight write can be lost. The retired table is
//! dropped last.
//!
//! The service itself is opaque; [`MigrationService`] is everything the
//! workflow needs from it.

pub mod actions;
pub mod workflow;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::JobDefinition;
use crate::workflow::ActionError;

#[cfg(test)]
use mockall::automock;

pub use workflow::{MigrationWorkflow, MIGRATION_WORKFLOW};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationServiceError {
    #[error("Migration service unavailable: {0}")]
    Unavailable(String),

    #[error("Migration service rejected request: {0}")]
    Rejected(String),
}

impl From<MigrationServiceError> for ActionError {
    fn from(err: MigrationServiceError) -> Self {
        ActionError::External(err.to_string())
    }
}

/// Latest progress reported for a migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// Unix seconds up to which writes to the live table have been
    /// replicated into the shadow table.
    pub checkpoint: Option<i64>,
    #[serde(default)]
    pub rows_replicated: u64,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MigrationService: Send + Sync {
    /// Create the shadow table with the target schema and start replicating
    /// into it. Returns the same id when called again for the same plan.
    async fn start_migration(&self, plan: &MigrationPlan) -> Result<String, MigrationServiceError>;

    async fn step_result(&self, migration_id: &str) -> Result<StepResult, MigrationServiceError>;

    /// Swap the shadow table in under the live name, keeping the old table
    /// as the plan's retired table.
    async fn cut_over(&self, migration_id: &str) -> Result<(), MigrationServiceError>;

    /// Undo a partial or complete cut over. A no-op when none happened.
    async fn abort_cutover(&self, migration_id: &str) -> Result<(), MigrationServiceError>;

    async fn drop_table(&self, table: &str) -> Result<(), MigrationServiceError>;
}

fn default_max_failures() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub table: String,
    pub shadow_table: String,
    pub retired_table: String,
    /// Passed through to the service as-is.
    pub target_schema: String,
    /// Job that copies existing rows into the shadow table, if the service
    /// does not do it itself.
    #[serde(default)]
    pub backfill: Option<JobDefinition>,
    /// Failed attempts of a single step before the migration is abandoned.
    /// Zero retries forever.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl MigrationPlan {
    pub fn new(table: impl Into<String>, target_schema: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            shadow_table: format!("_{table}_new"),
            retired_table: format!("_{table}_old"),
            table,
            target_schema: target_schema.into(),
            backfill: None,
            max_failures: default_max_failures(),
        }
    }

    pub fn with_backfill(mut self, job: JobDefinition) -> Self {
        self.backfill = Some(job);
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Pending,
    ShadowReady,
    Backfilling,
    Replicating,
    CutOver,
    Completed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationState::Pending => "pending",
            MigrationState::ShadowReady => "shadow_ready",
            MigrationState::Backfilling => "backfilling",
            MigrationState::Replicating => "replicating",
            MigrationState::CutOver => "cut_over",
            MigrationState::Completed => "completed",
        };
        write!(f, "{name}")
    }
}

/// Persisted context of one migration. `state` is the only thing the
/// current step is derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationContext {
    pub plan: MigrationPlan,
    pub state: MigrationState,
    #[serde(default)]
    pub migration_id: Option<String>,
    #[serde(default)]
    pub backfill_job_id: Option<String>,
    /// Numbers backfill submissions, so a retried submit reuses its job id
    /// and a resubmission after a failed job gets a new one.
    #[serde(default)]
    pub backfill_attempt: u32,
    #[serde(default)]
    pub rows_copied: Option<u64>,
    /// Failed attempts of the current step; reset when the state advances.
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl MigrationContext {
    pub fn new(plan: MigrationPlan) -> Self {
        Self {
            plan,
            state: MigrationState::Pending,
            migration_id: None,
            backfill_job_id: None,
            backfill_attempt: 0,
            rows_copied: None,
            failures: 0,
            last_error: None,
        }
    }
}
