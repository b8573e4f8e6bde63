use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use super::{check_id, check_version, JobStore, StoreError, WorkflowStore};
use crate::backend::JobRecord;
use crate::workflow::WorkflowRecord;

const WORKFLOW_DIR: &str = "workflows";
const JOB_DIR: &str = "jobs";
const LOCK_FILE: &str = ".store.lock";

trait Versioned: Serialize + DeserializeOwned + Send + 'static {
    fn id(&self) -> &str;
    fn version(&self) -> u64;
    fn bump(&mut self);
}

impl Versioned for WorkflowRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn bump(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

impl Versioned for JobRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn bump(&mut self) {
        self.version += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Update,
}

/// One pretty-printed JSON file per record under `<root>/workflows` and
/// `<root>/jobs`. Writes go through a temp file and a rename, and the
/// read-compare-write of a save happens under an exclusive `fd-lock` on
/// `<root>/.store.lock`, so several scheduler processes can share a directory.
#[derive(Debug, Clone)]
pub struct FileSystemStore {
    root: PathBuf,
}

impl FileSystemStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(WORKFLOW_DIR)).await?;
        fs::create_dir_all(root.join(JOB_DIR)).await?;
        debug!(root = ?root, "Opened file system store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: &str, id: &str) -> Result<PathBuf, StoreError> {
        check_id(id)?;
        Ok(self.root.join(kind).join(format!("{id}.json")))
    }

    async fn read_record<T: Versioned>(&self, kind: &str, id: &str) -> Result<Option<T>, StoreError> {
        match fs::read(self.record_path(kind, id)?).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_all<T: Versioned>(&self, kind: &str) -> Result<Vec<T>, StoreError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(self.root.join(kind)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                // Removed between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<T>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = ?path, error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }

    async fn write_locked<T: Versioned>(&self, kind: &str, mut record: T, mode: WriteMode) -> Result<T, StoreError> {
        let lock_path = self.root.join(LOCK_FILE);
        let path = self.record_path(kind, record.id())?;

        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            let mut lock = RwLock::new(lock_file);
            let _guard = lock.write().map_err(|e| StoreError::Lock {
                reason: e.to_string(),
            })?;

            let stored: Option<T> = match std::fs::read(&path) {
                Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };

            match (mode, stored) {
                (WriteMode::Insert, Some(_)) => return Err(StoreError::AlreadyExists(record.id().to_string())),
                (WriteMode::Insert, None) => {}
                (WriteMode::Update, None) => return Err(StoreError::NotFound(record.id().to_string())),
                (WriteMode::Update, Some(stored)) => {
                    check_version(record.id(), record.version(), stored.version())?;
                    record.bump();
                }
            }

            // Write to a temporary file first, then rename (atomic on one filesystem)
            let temp_path = path.with_extension("json.tmp");
            std::fs::write(&temp_path, serde_json::to_vec_pretty(&record)?)?;
            std::fs::rename(&temp_path, &path)?;
            Ok(record)
        })
        .await
        .map_err(|e| StoreError::Lock {
            reason: format!("store write task failed: {e}"),
        })?
    }
}

#[async_trait]
impl WorkflowStore for FileSystemStore {
    async fn insert_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        self.write_locked(WORKFLOW_DIR, record.clone(), WriteMode::Insert)
            .await?;
        Ok(())
    }

    async fn load_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        self.read_record(WORKFLOW_DIR, id).await
    }

    async fn save_workflow(&self, record: &mut WorkflowRecord) -> Result<(), StoreError> {
        *record = self
            .write_locked(WORKFLOW_DIR, record.clone(), WriteMode::Update)
            .await?;
        Ok(())
    }

    async fn list_due_workflows(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut due: Vec<WorkflowRecord> = self
            .read_all::<WorkflowRecord>(WORKFLOW_DIR)
            .await?
            .into_iter()
            .filter(|r| r.is_due(now))
            .collect();
        due.sort_by_key(|r| r.next_run_at);
        Ok(due)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut all = self.read_all::<WorkflowRecord>(WORKFLOW_DIR).await?;
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}

#[async_trait]
impl JobStore for FileSystemStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.write_locked(JOB_DIR, record.clone(), WriteMode::Insert)
            .await?;
        Ok(())
    }

    async fn load_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.read_record(JOB_DIR, id).await
    }

    async fn save_job(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        *record = self
            .write_locked(JOB_DIR, record.clone(), WriteMode::Update)
            .await?;
        Ok(())
    }

    async fn list_active_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut active: Vec<JobRecord> = self
            .read_all::<JobRecord>(JOB_DIR)
            .await?
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .collect();
        active.sort_by_key(|j| j.created_at);
        Ok(active)
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut all = self.read_all::<JobRecord>(JOB_DIR).await?;
        all.sort_by_key(|j| j.created_at);
        Ok(all)
    }
}
