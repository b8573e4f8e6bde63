use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{check_id, check_version, JobStore, StoreError, WorkflowStore};
use crate::backend::JobRecord;
use crate::workflow::WorkflowRecord;

/// Process-local store, used by tests and single-shot runs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    workflows: RwLock<HashMap<String, WorkflowRecord>>,
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn insert_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        check_id(&record.id)?;
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        workflows.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.workflows.read().await.get(id).cloned())
    }

    async fn save_workflow(&self, record: &mut WorkflowRecord) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write().await;
        let stored = workflows
            .get(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        check_version(&record.id, record.version, stored.version)?;

        record.version += 1;
        record.updated_at = Utc::now();
        workflows.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list_due_workflows(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowRecord>, StoreError> {
        let workflows = self.workflows.read().await;
        let mut due: Vec<WorkflowRecord> = workflows.values().filter(|r| r.is_due(now)).cloned().collect();
        due.sort_by_key(|r| r.next_run_at);
        Ok(due)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut all: Vec<WorkflowRecord> = self.workflows.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        check_id(&record.id)?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        jobs.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn save_job(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        check_version(&record.id, record.version, stored.version)?;

        record.version += 1;
        jobs.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list_active_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut active: Vec<JobRecord> = jobs.values().filter(|j| !j.status.is_terminal()).cloned().collect();
        active.sort_by_key(|j| j.created_at);
        Ok(active)
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut all: Vec<JobRecord> = self.jobs.read().await.values().cloned().collect();
        all.sort_by_key(|j| j.created_at);
        Ok(all)
    }
}
