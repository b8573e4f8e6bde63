use std::sync::Arc;

use super::actions::{AwaitBackfill, CutOver, DropRetiredTable, StartMigration, SubmitBackfill};
use super::{MigrationContext, MigrationService, MigrationState};
use crate::backend::ExecutionService;
use crate::valve::CheckpointGate;
use crate::workflow::{ActionError, ActionOutcome, ActionTable, WorkflowType};

/// Type tag of migration workflow records.
pub const MIGRATION_WORKFLOW: &str = "table_migration";

/// Where a backfill submission leads: waiting on the job, or straight to
/// replication when there was nothing to submit.
fn after_backfill_submit(_: &MigrationState, outcome: &ActionOutcome) -> MigrationState {
    if outcome.detail_str("job_id").is_some() {
        MigrationState::Backfilling
    } else {
        MigrationState::Replicating
    }
}

/// `pending -> shadow_ready -> [backfilling ->] replicating -> cut_over -> completed`
pub struct MigrationWorkflow {
    table: ActionTable<MigrationState, MigrationContext>,
}

impl MigrationWorkflow {
    pub fn new(service: Arc<dyn MigrationService>, execution: Arc<ExecutionService>, gate: CheckpointGate) -> Self {
        let table = ActionTable::new()
            .bind_to(
                MigrationState::Pending,
                Arc::new(StartMigration {
                    service: Arc::clone(&service),
                }),
                MigrationState::ShadowReady,
            )
            .bind(
                MigrationState::ShadowReady,
                Arc::new(SubmitBackfill {
                    execution: Arc::clone(&execution),
                }),
                after_backfill_submit,
            )
            .bind(
                MigrationState::Backfilling,
                Arc::new(AwaitBackfill { execution }),
                |state: &MigrationState, outcome: &ActionOutcome| {
                    if outcome.detail_str("job_id").is_some() {
                        // Resubmitted after a failed job; keep waiting.
                        *state
                    } else {
                        MigrationState::Replicating
                    }
                },
            )
            .bind_to(
                MigrationState::Replicating,
                Arc::new(CutOver {
                    service: Arc::clone(&service),
                    gate,
                }),
                MigrationState::CutOver,
            )
            .bind_to(
                MigrationState::CutOver,
                Arc::new(DropRetiredTable { service }),
                MigrationState::Completed,
            );
        Self { table }
    }
}

impl WorkflowType for MigrationWorkflow {
    type State = MigrationState;
    type Context = MigrationContext;

    fn type_tag(&self) -> &str {
        MIGRATION_WORKFLOW
    }

    fn actions(&self) -> &ActionTable<MigrationState, MigrationContext> {
        &self.table
    }

    fn resolve_state(&self, context: &MigrationContext) -> MigrationState {
        context.state
    }

    fn on_action_complete(
        &self,
        old: &MigrationState,
        new: &MigrationState,
        outcome: &ActionOutcome,
        context: &mut MigrationContext,
    ) {
        if let Some(id) = outcome.detail_str("migration_id") {
            context.migration_id = Some(id.to_string());
        }
        if let Some(job_id) = outcome.detail_str("job_id") {
            context.backfill_job_id = Some(job_id.to_string());
        }
        if let Some(rows) = outcome.detail.get("rows_copied").and_then(|v| v.as_u64()) {
            context.rows_copied = Some(rows);
        }
        if old != new {
            context.failures = 0;
        }
        context.last_error = None;
        context.state = *new;
    }

    fn handle_exception(&self, context: &mut MigrationContext, error: &ActionError) {
        context.last_error = Some(error.to_string());
        if error.is_not_ready() {
            return;
        }
        context.failures += 1;
        if context.state == MigrationState::Backfilling && matches!(error, ActionError::Failed(_)) {
            context.backfill_job_id = None;
            context.backfill_attempt += 1;
        }
    }

    fn terminal_failure(&self, context: &MigrationContext) -> Option<String> {
        let budget = context.plan.max_failures;
        (budget > 0 && context.failures >= budget).then(|| {
            format!(
                "{} failed {} times in state {}: {}",
                context.plan.table,
                context.failures,
                context.state,
                context.last_error.as_deref().unwrap_or("unknown error")
            )
        })
    }
}
