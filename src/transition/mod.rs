//! Deterministic state-transition validation
//!
//! A [`TransitionTable`] holds predicate-based transitions for any finite-state
//! domain. [`TransitionValidator::next`] resolves exactly one transition for a
//! `(state, event)` pair or fails:
//!
//! - no transition accepts the state: the state is terminal for this table
//! - transitions accept the state but none accept the event: unknown event
//! - more than one transition accepts both: ambiguous table (configuration bug)
//!
//! Resolution never depends on registration order.

use std::fmt;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("State {state} is terminal: no transitions leave it")]
    TerminalState { state: String },

    #[error("Unknown event {event} for state {state}")]
    UnknownEvent { state: String, event: String },

    #[error("Ambiguous transition: {matches} transitions match state {state} and event {event}")]
    Ambiguous {
        state: String,
        event: String,
        matches: usize,
    },
}

type StatePredicate<S> = Box<dyn Fn(&S) -> bool + Send + Sync>;
type EventPredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type Resolver<S, E> = Box<dyn Fn(&S, &E) -> S + Send + Sync>;

/// One edge of a transition table: state predicate, event predicate and the
/// function producing the resulting state.
pub struct Transition<S, E> {
    label: String,
    accepts_state: StatePredicate<S>,
    accepts_event: EventPredicate<E>,
    resolve: Resolver<S, E>,
}

impl<S, E> Transition<S, E> {
    pub fn new<FS, FE, FR>(label: impl Into<String>, accepts_state: FS, accepts_event: FE, resolve: FR) -> Self
    where
        FS: Fn(&S) -> bool + Send + Sync + 'static,
        FE: Fn(&E) -> bool + Send + Sync + 'static,
        FR: Fn(&S, &E) -> S + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            accepts_state: Box::new(accepts_state),
            accepts_event: Box::new(accepts_event),
            resolve: Box::new(resolve),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn matches_state(&self, state: &S) -> bool {
        (self.accepts_state)(state)
    }

    fn matches_event(&self, event: &E) -> bool {
        (self.accepts_event)(event)
    }

    fn target(&self, state: &S, event: &E) -> S {
        (self.resolve)(state, event)
    }
}

impl<S, E> Transition<S, E>
where
    S: PartialEq + Clone + fmt::Debug + Send + Sync + 'static,
    E: PartialEq + fmt::Debug + Send + Sync + 'static,
{
    /// Exact-match edge: `from --on--> to`.
    pub fn between(from: S, on: E, to: S) -> Self {
        let label = format!("{from:?} --{on:?}--> {to:?}");
        Self::new(label, move |s| *s == from, move |e| *e == on, move |_, _| to.clone())
    }
}

impl<S, E> fmt::Debug for Transition<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition").field("label", &self.label).finish()
    }
}

/// Computes the unique next state for a `(state, event)` pair.
///
/// Implementors only supply the transitions; `next` is provided. Override
/// [`on_transition_observed`](Self::on_transition_observed) to attach logging
/// or side effects to every accepted transition.
pub trait TransitionValidator<S: fmt::Debug, E: fmt::Debug> {
    fn transitions(&self) -> &[Transition<S, E>];

    fn on_transition_observed(&self, _from: &S, _event: &E, _to: &S) {}

    fn next(&self, event: &E, current: &S) -> Result<S, TransitionError> {
        let for_state: Vec<&Transition<S, E>> = self
            .transitions()
            .iter()
            .filter(|t| t.matches_state(current))
            .collect();

        if for_state.is_empty() {
            return Err(TransitionError::TerminalState {
                state: format!("{current:?}"),
            });
        }

        let matching: Vec<&Transition<S, E>> = for_state
            .into_iter()
            .filter(|t| t.matches_event(event))
            .collect();

        match matching.as_slice() {
            [] => Err(TransitionError::UnknownEvent {
                state: format!("{current:?}"),
                event: format!("{event:?}"),
            }),
            [only] => {
                let next = only.target(current, event);
                self.on_transition_observed(current, event, &next);
                Ok(next)
            }
            many => Err(TransitionError::Ambiguous {
                state: format!("{current:?}"),
                event: format!("{event:?}"),
                matches: many.len(),
            }),
        }
    }
}

/// Named, immutable list of transitions. Build it once and share it.
pub struct TransitionTable<S, E> {
    name: String,
    transitions: Vec<Transition<S, E>>,
}

impl<S, E> TransitionTable<S, E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transitions: Vec::new(),
        }
    }

    pub fn with(mut self, transition: Transition<S, E>) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

impl<S: fmt::Debug, E: fmt::Debug> TransitionValidator<S, E> for TransitionTable<S, E> {
    fn transitions(&self) -> &[Transition<S, E>] {
        &self.transitions
    }

    fn on_transition_observed(&self, from: &S, event: &E, to: &S) {
        debug!(
            table = %self.name,
            from = ?from,
            event = ?event,
            to = ?to,
            "Transition observed"
        );
    }
}

impl<S, E> fmt::Debug for TransitionTable<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionTable")
            .field("name", &self.name)
            .field("transitions", &self.transitions)
            .finish()
    }
}
