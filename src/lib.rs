// opsflow - orchestration engine for long-running operational workflows
// This exposes the core components for embedding and integration tests

pub mod backend;
pub mod config;
pub mod error;
pub mod migration;
pub mod monitor;
pub mod resource;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod transition;
pub mod valve;
pub mod worker;
pub mod workflow;

// Re-export key types for easy access
pub use backend::{
    ExecutionBackend, ExecutionService, ExecutorIdentifier, ExecutorKind, JobDefinition, JobRecord, JobResult,
    JobStatus,
};
pub use config::OpsflowConfig;
pub use error::OpsflowError;
pub use migration::{MigrationContext, MigrationPlan, MigrationService, MigrationWorkflow};
pub use monitor::{LifecycleEvent, LifecycleKind, MonitoringSink};
pub use resource::{ResourceEvent, ResourceLifecycle, ResourceState};
pub use scheduler::{JobScheduler, SchedulerSettings};
pub use shutdown::ShutdownCoordinator;
pub use store::{FileSystemStore, InMemoryStore, Store};
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use transition::{Transition, TransitionError, TransitionTable, TransitionValidator};
pub use valve::{await_condition, CheckpointGate, Valve};
pub use workflow::{Action, ActionError, ActionOutcome, WorkflowRecord, WorkflowRunner, WorkflowStateMachine, WorkflowType};
