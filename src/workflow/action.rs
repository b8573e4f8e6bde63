// Actions bound to workflow states, and the registration table that binds them

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What an action reports back on success. `detail` is free-form and is read
/// by the workflow type's `on_action_complete`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub summary: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl ActionOutcome {
    pub fn done(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(summary: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            summary: summary.into(),
            detail,
        }
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.detail.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The awaited condition does not hold yet. Same retry path as a failure,
    /// but it is an expected outcome.
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("{0}")]
    Failed(String),

    #[error("External service error: {0}")]
    External(String),
}

impl ActionError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, ActionError::NotReady(_))
    }
}

/// One idempotent unit of work. An action that fails must either leave no
/// trace or undo it in `rollback`, because the state machine will run it
/// again on the next `schedule()`.
#[async_trait]
pub trait Action<C>: Send + Sync
where
    C: Send + Sync,
{
    fn name(&self) -> &str;

    async fn execute(&self, context: &C) -> Result<ActionOutcome, ActionError>;

    async fn rollback(&self, _context: &C) -> Result<(), ActionError> {
        Ok(())
    }
}

pub type StateTransfer<S> = Arc<dyn Fn(&S, &ActionOutcome) -> S + Send + Sync>;

pub struct ActionBinding<S, C> {
    pub action: Arc<dyn Action<C>>,
    transfer: StateTransfer<S>,
}

impl<S, C> ActionBinding<S, C> {
    pub fn next_state(&self, current: &S, outcome: &ActionOutcome) -> S {
        (self.transfer)(current, outcome)
    }
}

/// state -> (action, state transfer). Built once per workflow type and only
/// read afterwards, so it is shared freely across tasks.
pub struct ActionTable<S, C> {
    bindings: HashMap<S, ActionBinding<S, C>>,
    conflicts: Vec<String>,
}

impl<S, C> Default for ActionTable<S, C>
where
    S: Eq + Hash,
{
    fn default() -> Self {
        Self {
            bindings: HashMap::new(),
            conflicts: Vec::new(),
        }
    }
}

impl<S, C> ActionTable<S, C>
where
    S: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    C: Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `action` to `state`, computing the next state with `transfer`.
    /// A second binding for the same state is recorded as a conflict and
    /// ignored.
    pub fn bind<F>(mut self, state: S, action: Arc<dyn Action<C>>, transfer: F) -> Self
    where
        F: Fn(&S, &ActionOutcome) -> S + Send + Sync + 'static,
    {
        if self.bindings.contains_key(&state) {
            self.conflicts.push(format!("{state:?} bound more than once"));
            return self;
        }
        self.bindings.insert(
            state,
            ActionBinding {
                action,
                transfer: Arc::new(transfer),
            },
        );
        self
    }

    /// Bind `action` to `state` with a fixed successor.
    pub fn bind_to(self, state: S, action: Arc<dyn Action<C>>, next: S) -> Self {
        self.bind(state, action, move |_, _| next.clone())
    }

    pub fn get(&self, state: &S) -> Option<&ActionBinding<S, C>> {
        self.bindings.get(state)
    }

    pub fn conflicts(&self) -> &[String] {
        &self.conflicts
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
