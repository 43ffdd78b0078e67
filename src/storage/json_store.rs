use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::engine::params::ParamStore;
use crate::engine::types::{Direction, WorkflowRecord, WorkflowStatus, WorkflowSummary};
use crate::storage::{LockMode, ResourceLock, WorkflowStore, apply_lock, remove_holder};

const LOCK_FILE: &str = "locks.json";

/// File-based JSON workflow store. Each workflow is one JSON file; the
/// resource lock table is a single `locks.json` beside them. Writes go
/// through a temp file and rename, so a crash never leaves a torn record —
/// the previous durable step transition stays intact.
pub struct JsonWorkflowStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonWorkflowStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }

    fn locks_path(&self) -> PathBuf {
        self.base_dir.join(LOCK_FILE)
    }

    async fn read_record(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        let path = self.record_path(id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read workflow file: {}", path.display()));
            }
        };
        let record: WorkflowRecord = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse workflow record: {}", id))?;
        Ok(Some(record))
    }

    async fn write_record(&self, record: &WorkflowRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        write_atomic(&path, &serde_json::to_string_pretty(record)?).await
    }

    async fn read_locks(&self) -> Result<BTreeMap<String, ResourceLock>> {
        let path = self.locks_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse lock table: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read lock table: {}", path.display()))
            }
        }
    }

    async fn write_locks(&self, locks: &BTreeMap<String, ResourceLock>) -> Result<()> {
        write_atomic(&self.locks_path(), &serde_json::to_string_pretty(locks)?).await
    }

    async fn scan_records(&self) -> Result<Vec<WorkflowRecord>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(LOCK_FILE) {
                continue;
            }
            if let Ok(data) = tokio::fs::read_to_string(&path).await
                && let Ok(record) = serde_json::from_str::<WorkflowRecord>(&data)
            {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(records)
    }
}

async fn write_atomic(path: &Path, data: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, data).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[async_trait]
impl WorkflowStore for JsonWorkflowStore {
    async fn create(&self, record: &WorkflowRecord) -> Result<()> {
        let _lock = self.lock.write().await;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        if self.record_path(&record.id).exists() {
            bail!("workflow already exists: {}", record.id);
        }
        self.write_record(record).await
    }

    async fn record_step(
        &self,
        id: &str,
        direction: Direction,
        step_index: i32,
        working: &ParamStore,
        error: Option<&str>,
    ) -> Result<()> {
        let _lock = self.lock.write().await;
        let Some(mut record) = self.read_record(id).await? else {
            bail!("workflow not found: {}", id);
        };
        record.direction = direction;
        record.step_index = step_index;
        record.working = working.clone();
        record.error = error.map(str::to_string);
        self.write_record(&record).await
    }

    async fn complete(
        &self,
        id: &str,
        status: WorkflowStatus,
        working: &ParamStore,
        error: Option<&str>,
    ) -> Result<()> {
        let _lock = self.lock.write().await;
        let Some(mut record) = self.read_record(id).await? else {
            bail!("workflow not found: {}", id);
        };
        if record.status != WorkflowStatus::Running {
            return Ok(());
        }
        record.status = status;
        record.working = working.clone();
        record.error = error.map(str::to_string);
        record.completed_at = Some(Utc::now());
        self.write_record(&record).await
    }

    async fn get(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        let _lock = self.lock.read().await;
        self.read_record(id).await
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<WorkflowSummary>> {
        let _lock = self.lock.read().await;
        let records = self.scan_records().await?;
        Ok(records
            .iter()
            .map(WorkflowSummary::from)
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn recover_running(&self) -> Result<Vec<WorkflowRecord>> {
        let _lock = self.lock.read().await;
        let records = self.scan_records().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.status == WorkflowStatus::Running)
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.record_path(id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn try_lock(&self, resource_id: &str, mode: LockMode, holder_id: &str) -> Result<bool> {
        let _lock = self.lock.write().await;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let mut locks = self.read_locks().await?;
        match apply_lock(locks.get(resource_id), resource_id, mode, holder_id) {
            Ok(updated) => {
                locks.insert(resource_id.to_string(), updated);
                self.write_locks(&locks).await?;
                Ok(true)
            }
            Err(()) => Ok(false),
        }
    }

    async fn unlock(&self, resource_id: &str, holder_id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut locks = self.read_locks().await?;
        if let Some(lock) = locks.get(resource_id) {
            match remove_holder(lock, holder_id) {
                Some(updated) => {
                    locks.insert(resource_id.to_string(), updated);
                }
                None => {
                    locks.remove(resource_id);
                }
            }
            self.write_locks(&locks).await?;
        }
        Ok(())
    }

    async fn get_lock(&self, resource_id: &str) -> Result<Option<ResourceLock>> {
        let _lock = self.lock.read().await;
        let locks = self.read_locks().await?;
        Ok(locks.get(resource_id).cloned())
    }
}
