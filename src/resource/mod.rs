//! Canonical resource lifecycle shared by every execution backend
//!
//! Backends translate their native status (process liveness and exit code,
//! pod phase) into a [`ResourceEvent`]. The [`ResourceLifecycle`] table then
//! folds that event into the canonical [`ResourceState`], so callers never see
//! backend vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::transition::{Transition, TransitionTable, TransitionValidator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Creating,
    Running,
    Destroying,
    Destroyed,
    ErrorState,
    Unknown,
}

impl ResourceState {
    pub const ALL: [ResourceState; 6] = [
        ResourceState::Creating,
        ResourceState::Running,
        ResourceState::Destroying,
        ResourceState::Destroyed,
        ResourceState::ErrorState,
        ResourceState::Unknown,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceState::Destroyed)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceState::Creating => "CREATING",
            ResourceState::Running => "RUNNING",
            ResourceState::Destroying => "DESTROYING",
            ResourceState::Destroyed => "DESTROYED",
            ResourceState::ErrorState => "ERROR_STATE",
            ResourceState::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

/// Backend-neutral observation about a dispatched executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceEvent {
    /// Still being scheduled, pulled or spawned.
    Provisioning,
    Started,
    TerminationRequested,
    /// The worker finished on its own; teardown is under way.
    Completed,
    Failed { reason: String },
    /// The executor no longer exists on the backend.
    Gone,
    CommunicationLost { reason: String },
}

impl ResourceEvent {
    /// The state this observation implies on its own, used when recovering
    /// from `UNKNOWN`.
    pub fn implied_state(&self) -> ResourceState {
        match self {
            ResourceEvent::Provisioning => ResourceState::Creating,
            ResourceEvent::Started => ResourceState::Running,
            ResourceEvent::TerminationRequested | ResourceEvent::Completed => ResourceState::Destroying,
            ResourceEvent::Failed { .. } => ResourceState::ErrorState,
            ResourceEvent::Gone => ResourceState::Destroyed,
            ResourceEvent::CommunicationLost { .. } => ResourceState::Unknown,
        }
    }

    fn is_communication_lost(&self) -> bool {
        matches!(self, ResourceEvent::CommunicationLost { .. })
    }
}

fn edge(
    from: ResourceState,
    accepts: fn(&ResourceEvent) -> bool,
    to: ResourceState,
) -> Transition<ResourceState, ResourceEvent> {
    Transition::new(
        format!("{from} -> {to}"),
        move |s: &ResourceState| *s == from,
        accepts,
        move |_: &ResourceState, _: &ResourceEvent| to,
    )
}

/// The canonical `ResourceState` transition table.
pub struct ResourceLifecycle {
    table: TransitionTable<ResourceState, ResourceEvent>,
}

impl Default for ResourceLifecycle {
    fn default() -> Self {
        Self::canonical()
    }
}

impl ResourceLifecycle {
    pub fn canonical() -> Self {
        use ResourceEvent as Ev;
        use ResourceState::*;

        let table = TransitionTable::new("resource-lifecycle")
            // CREATING
            .with(edge(Creating, |e| matches!(e, Ev::Provisioning), Creating))
            .with(edge(Creating, |e| matches!(e, Ev::Started), Running))
            .with(edge(Creating, |e| matches!(e, Ev::Failed { .. } | Ev::Gone), ErrorState))
            .with(edge(
                Creating,
                |e| matches!(e, Ev::TerminationRequested | Ev::Completed),
                Destroying,
            ))
            // RUNNING
            .with(edge(Running, |e| matches!(e, Ev::Started), Running))
            .with(edge(
                Running,
                |e| matches!(e, Ev::TerminationRequested | Ev::Completed),
                Destroying,
            ))
            .with(edge(Running, |e| matches!(e, Ev::Failed { .. } | Ev::Gone), ErrorState))
            // DESTROYING: the task may keep running for a while after teardown
            // was requested.
            .with(edge(Destroying, |e| matches!(e, Ev::Gone), Destroyed))
            .with(edge(Destroying, |e| matches!(e, Ev::Failed { .. }), ErrorState))
            .with(edge(
                Destroying,
                |e| {
                    matches!(
                        e,
                        Ev::Provisioning | Ev::Started | Ev::Completed | Ev::TerminationRequested
                    )
                },
                Destroying,
            ))
            // ERROR_STATE
            .with(edge(ErrorState, |e| matches!(e, Ev::TerminationRequested), Destroying))
            .with(edge(ErrorState, |e| matches!(e, Ev::Gone), Destroyed))
            .with(edge(
                ErrorState,
                |e| matches!(e, Ev::Provisioning | Ev::Started | Ev::Completed | Ev::Failed { .. }),
                ErrorState,
            ))
            // Any live state loses contact the same way.
            .with(Transition::new(
                "* -> UNKNOWN",
                |s: &ResourceState| !matches!(s, Destroyed),
                |e: &ResourceEvent| e.is_communication_lost(),
                |_: &ResourceState, _: &ResourceEvent| Unknown,
            ))
            // UNKNOWN recovers to whatever the backend reports.
            .with(Transition::new(
                "UNKNOWN -> *",
                |s: &ResourceState| *s == Unknown,
                |e: &ResourceEvent| !e.is_communication_lost(),
                |_: &ResourceState, e: &ResourceEvent| e.implied_state(),
            ));

        Self { table }
    }
}

impl TransitionValidator<ResourceState, ResourceEvent> for ResourceLifecycle {
    fn transitions(&self) -> &[Transition<ResourceState, ResourceEvent>] {
        self.table.transitions()
    }

    fn on_transition_observed(&self, from: &ResourceState, event: &ResourceEvent, to: &ResourceState) {
        if from != to {
            info!(from = %from, to = %to, event = ?event, "Resource state changed");
        } else {
            trace!(state = %from, event = ?event, "Resource state unchanged");
        }
    }
}
