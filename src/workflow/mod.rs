//! Workflow engine: action tables, the per-type state machine, persisted
//! records, and the runner that steps records through the store.

pub mod action;
pub mod machine;
pub mod record;
pub mod runner;

pub use action::{Action, ActionError, ActionOutcome, ActionTable};
pub use machine::{ScheduleOutcome, WorkflowStateMachine, WorkflowType};
pub use record::{HistoryEntry, WorkflowRecord, WorkflowStatus};
pub use runner::{DriveOutcome, DriveReport, WorkflowDriver, WorkflowRunner};
