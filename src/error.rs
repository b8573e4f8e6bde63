// Crate-wide error categories
//
// Module errors stay close to the code that raises them and fold into
// `OpsflowError` at the scheduler/runner boundary.

use thiserror::Error;

use crate::backend::{BackendError, ContextError};
use crate::store::StoreError;
use crate::transition::TransitionError;
use crate::workflow::ActionError;

#[derive(Debug, Error)]
pub enum OpsflowError {
    /// Ambiguous or missing transitions, unknown job or workflow types.
    /// Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Probe or backend communication failure. Retried on the next tick.
    #[error("Transient external failure: {0}")]
    TransientExternal(String),

    /// An action failed and was compensated; the instance keeps its state.
    #[error("Action '{action}' failed: {source}")]
    ActionFailure {
        action: String,
        #[source]
        source: ActionError,
    },

    /// The workflow type decided to stop retrying.
    #[error("Workflow {workflow_id} stopped: {reason}")]
    TerminalWorkflow { workflow_id: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job context error: {0}")]
    Context(#[from] ContextError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OpsflowError {
    pub fn configuration(message: impl Into<String>) -> Self {
        OpsflowError::Configuration(message.into())
    }

    /// Whether the failing record should simply be picked up again next tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            OpsflowError::Configuration(_) | OpsflowError::TerminalWorkflow { .. } => false,
            OpsflowError::TransientExternal(_) | OpsflowError::ActionFailure { .. } => true,
            OpsflowError::Store(e) => e.is_retryable(),
            OpsflowError::Context(_) | OpsflowError::Json(_) => false,
        }
    }
}

impl From<TransitionError> for OpsflowError {
    fn from(err: TransitionError) -> Self {
        // Every transition failure means the table does not describe the
        // domain; none of them heal by waiting.
        OpsflowError::Configuration(err.to_string())
    }
}

impl From<BackendError> for OpsflowError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::UnsupportedExecutor(_) | BackendError::InvalidHandle(_) => {
                OpsflowError::Configuration(err.to_string())
            }
            other => OpsflowError::TransientExternal(other.to_string()),
        }
    }
}
