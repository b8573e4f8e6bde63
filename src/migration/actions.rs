use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{MigrationContext, MigrationService};
use crate::backend::{ExecutionService, JobStatus};
use crate::valve::{CheckpointGate, CheckpointSource};
use crate::workflow::{Action, ActionError, ActionOutcome};

fn migration_id(context: &MigrationContext) -> Result<&str, ActionError> {
    context
        .migration_id
        .as_deref()
        .ok_or_else(|| ActionError::Failed("migration was never started".to_string()))
}

/// `pending`: create the shadow table and start replication.
pub struct StartMigration {
    pub service: Arc<dyn MigrationService>,
}

#[async_trait]
impl Action<MigrationContext> for StartMigration {
    fn name(&self) -> &str {
        "start_migration"
    }

    async fn execute(&self, context: &MigrationContext) -> Result<ActionOutcome, ActionError> {
        let migration_id = self.service.start_migration(&context.plan).await?;
        Ok(ActionOutcome::with_detail(
            format!("shadow table {} created", context.plan.shadow_table),
            json!({ "migration_id": migration_id }),
        ))
    }
}

/// Job id of one backfill attempt, stable across retries of the same
/// submission.
pub(crate) fn backfill_job_id(migration_id: &str, attempt: u32) -> String {
    let base: String = migration_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{base}-backfill-{attempt}")
}

async fn submit_backfill(execution: &ExecutionService, context: &MigrationContext) -> Result<ActionOutcome, ActionError> {
    let Some(definition) = context.plan.backfill.clone() else {
        return Ok(ActionOutcome::done("no backfill configured"));
    };
    let definition = definition
        .with_id(backfill_job_id(migration_id(context)?, context.backfill_attempt))
        .with_property("migration.table", context.plan.table.as_str())
        .with_property("migration.shadow_table", context.plan.shadow_table.as_str());

    let job_id = execution
        .submit(definition)
        .await
        .map_err(|e| ActionError::External(e.to_string()))?;
    info!(job_id = %job_id, table = %context.plan.table, "Backfill job submitted");
    Ok(ActionOutcome::with_detail(
        format!("backfill job {job_id} submitted"),
        json!({ "job_id": job_id }),
    ))
}

/// `shadow_ready`: submit the backfill job, if the plan has one.
pub struct SubmitBackfill {
    pub execution: Arc<ExecutionService>,
}

#[async_trait]
impl Action<MigrationContext> for SubmitBackfill {
    fn name(&self) -> &str {
        "submit_backfill"
    }

    async fn execute(&self, context: &MigrationContext) -> Result<ActionOutcome, ActionError> {
        submit_backfill(&self.execution, context).await
    }
}

/// `backfilling`: wait for the backfill job. A job that ended without
/// succeeding fails the step; the workflow then forgets it and the next
/// attempt submits a fresh one under the next attempt number.
pub struct AwaitBackfill {
    pub execution: Arc<ExecutionService>,
}

#[async_trait]
impl Action<MigrationContext> for AwaitBackfill {
    fn name(&self) -> &str {
        "await_backfill"
    }

    async fn execute(&self, context: &MigrationContext) -> Result<ActionOutcome, ActionError> {
        let Some(job_id) = context.backfill_job_id.as_deref() else {
            return submit_backfill(&self.execution, context).await;
        };

        let job = self
            .execution
            .store()
            .load_job(job_id)
            .await
            .map_err(|e| ActionError::External(e.to_string()))?
            .ok_or_else(|| ActionError::Failed(format!("backfill job {job_id} no longer exists")))?;

        match job.status {
            JobStatus::Succeeded => {
                let rows = job
                    .result
                    .as_ref()
                    .and_then(|r| r.output.get("rows_copied"))
                    .and_then(|v| v.as_u64());
                Ok(ActionOutcome::with_detail(
                    format!("backfill job {job_id} finished"),
                    json!({ "rows_copied": rows }),
                ))
            }
            JobStatus::Failed | JobStatus::Cancelled => Err(ActionError::Failed(format!(
                "backfill job {job_id} ended {:?}: {}",
                job.status,
                job.last_error.as_deref().unwrap_or("no error recorded")
            ))),
            status => Err(ActionError::NotReady(format!("backfill job {job_id} is {status:?}"))),
        }
    }
}

struct ServiceCheckpoint<'a> {
    service: &'a dyn MigrationService,
    migration_id: &'a str,
}

#[async_trait]
impl CheckpointSource for ServiceCheckpoint<'_> {
    async fn checkpoint(&self) -> Result<Option<i64>, String> {
        self.service
            .step_result(self.migration_id)
            .await
            .map(|step| step.checkpoint)
            .map_err(|e| e.to_string())
    }
}

/// `replicating`: wait until replication has caught up, then cut over.
/// Rolling back aborts the cut over.
pub struct CutOver {
    pub service: Arc<dyn MigrationService>,
    pub gate: CheckpointGate,
}

#[async_trait]
impl Action<MigrationContext> for CutOver {
    fn name(&self) -> &str {
        "cut_over"
    }

    async fn execute(&self, context: &MigrationContext) -> Result<ActionOutcome, ActionError> {
        let migration_id = migration_id(context)?;
        let source = ServiceCheckpoint {
            service: self.service.as_ref(),
            migration_id,
        };
        if !self.gate.wait_for(&source).await {
            return Err(ActionError::NotReady(format!(
                "replication checkpoint is older than {}s",
                self.gate.allowed_skew.as_secs()
            )));
        }

        self.service.cut_over(migration_id).await?;
        Ok(ActionOutcome::done(format!(
            "{} now serves the target schema",
            context.plan.table
        )))
    }

    async fn rollback(&self, context: &MigrationContext) -> Result<(), ActionError> {
        let Some(migration_id) = context.migration_id.as_deref() else {
            return Ok(());
        };
        warn!(migration_id = %migration_id, table = %context.plan.table, "Aborting cut over");
        self.service.abort_cutover(migration_id).await?;
        Ok(())
    }
}

/// `cut_over`: drop the retired table.
pub struct DropRetiredTable {
    pub service: Arc<dyn MigrationService>,
}

#[async_trait]
impl Action<MigrationContext> for DropRetiredTable {
    fn name(&self) -> &str {
        "drop_retired_table"
    }

    async fn execute(&self, context: &MigrationContext) -> Result<ActionOutcome, ActionError> {
        self.service.drop_table(&context.plan.retired_table).await?;
        Ok(ActionOutcome::done(format!("dropped {}", context.plan.retired_table)))
    }
}
