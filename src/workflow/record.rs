use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Active,
    Completed,
    Abandoned,
}

impl WorkflowStatus {
    pub fn is_archived(&self) -> bool {
        !matches!(self, WorkflowStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: String,
    pub to: String,
    pub action: String,
    pub summary: String,
    pub at: DateTime<Utc>,
}

/// Persisted form of one workflow instance. The context is kept as JSON so
/// one store serves every workflow type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub workflow_type: String,
    pub context: serde_json::Value,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub last_error: Option<String>,
    /// Consecutive failed attempts of the current step.
    #[serde(default)]
    pub failed_attempts: u32,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new<C: Serialize>(workflow_type: &str, context: &C) -> Result<Self, serde_json::Error> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            workflow_type: workflow_type.to_string(),
            context: serde_json::to_value(context)?,
            status: WorkflowStatus::Active,
            history: Vec::new(),
            last_error: None,
            failed_attempts: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            next_run_at: now,
        })
    }

    pub fn context_as<C: DeserializeOwned>(&self) -> Result<C, serde_json::Error> {
        serde_json::from_value(self.context.clone())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkflowStatus::Active && self.next_run_at <= now
    }

    pub fn current_step(&self) -> Option<&str> {
        self.history.last().map(|h| h.to.as_str())
    }
}
