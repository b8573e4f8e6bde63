use std::fmt;
use std::hash::Hash;

use tracing::{debug, error, info, warn};

use super::action::{ActionError, ActionOutcome, ActionTable};
use crate::error::OpsflowError;

/// A workflow type: how to read the current state out of a context, which
/// actions run in which state, and how results are written back.
///
/// The current state is always derived from the persisted context, never
/// tracked separately, so a crashed scheduler resumes exactly where the last
/// successful `on_action_complete` left off.
pub trait WorkflowType: Send + Sync + 'static {
    type State: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type Context: Send + Sync + 'static;

    /// Tag stored on every record of this type.
    fn type_tag(&self) -> &str;

    fn actions(&self) -> &ActionTable<Self::State, Self::Context>;

    fn resolve_state(&self, context: &Self::Context) -> Self::State;

    fn on_action_complete(
        &self,
        old: &Self::State,
        new: &Self::State,
        outcome: &ActionOutcome,
        context: &mut Self::Context,
    );

    /// Called after a failed action has been rolled back. Must not change
    /// the state `resolve_state` derives.
    fn handle_exception(&self, context: &mut Self::Context, error: &ActionError);

    /// An explicit decision to stop retrying, e.g. a spent retry budget.
    fn terminal_failure(&self, _context: &Self::Context) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome<S> {
    Advanced {
        from: S,
        to: S,
        action: String,
        outcome: ActionOutcome,
    },
    Failed {
        state: S,
        action: String,
        error: ActionError,
    },
    /// No action is bound to the current state.
    Terminal { state: S },
    Abandoned { state: S, reason: String },
}

impl<S> ScheduleOutcome<S> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScheduleOutcome::Terminal { .. } | ScheduleOutcome::Abandoned { .. })
    }
}

pub struct WorkflowStateMachine<W: WorkflowType> {
    workflow: W,
}

impl<W: WorkflowType> WorkflowStateMachine<W> {
    pub fn new(workflow: W) -> Result<Self, OpsflowError> {
        if let Some(conflict) = workflow.actions().conflicts().first() {
            return Err(OpsflowError::configuration(format!(
                "workflow type '{}': {conflict}",
                workflow.type_tag()
            )));
        }
        Ok(Self { workflow })
    }

    pub fn workflow(&self) -> &W {
        &self.workflow
    }

    /// Run one step: resolve the state, run its action, then either advance
    /// or compensate and stay put. Never returns an error; failures are part
    /// of the outcome.
    pub async fn schedule(&self, context: &mut W::Context) -> ScheduleOutcome<W::State> {
        let workflow = &self.workflow;
        let state = workflow.resolve_state(context);

        if let Some(reason) = workflow.terminal_failure(context) {
            info!(workflow_type = %workflow.type_tag(), state = %state, reason = %reason, "Workflow abandoned");
            return ScheduleOutcome::Abandoned { state, reason };
        }

        let Some(binding) = workflow.actions().get(&state) else {
            debug!(workflow_type = %workflow.type_tag(), state = %state, "No action bound, workflow is terminal");
            return ScheduleOutcome::Terminal { state };
        };

        let action_name = binding.action.name().to_string();
        debug!(workflow_type = %workflow.type_tag(), state = %state, action = %action_name, "Executing action");

        match binding.action.execute(context).await {
            Ok(outcome) => {
                let next = binding.next_state(&state, &outcome);
                workflow.on_action_complete(&state, &next, &outcome, context);
                info!(
                    workflow_type = %workflow.type_tag(),
                    action = %action_name,
                    from = %state,
                    to = %next,
                    "Action completed"
                );
                ScheduleOutcome::Advanced {
                    from: state,
                    to: next,
                    action: action_name,
                    outcome,
                }
            }
            Err(err) => {
                if err.is_not_ready() {
                    info!(action = %action_name, state = %state, reason = %err, "Action not ready, will retry");
                } else {
                    warn!(action = %action_name, state = %state, error = %err, "Action failed, compensating");
                }

                if let Err(rollback_err) = binding.action.rollback(context).await {
                    error!(
                        action = %action_name,
                        state = %state,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }

                workflow.handle_exception(context, &err);

                let after = workflow.resolve_state(context);
                if after != state {
                    error!(
                        workflow_type = %workflow.type_tag(),
                        before = %state,
                        after = %after,
                        "handle_exception changed the derived state"
                    );
                }

                ScheduleOutcome::Failed {
                    state,
                    action: action_name,
                    error: err,
                }
            }
        }
    }
}
