use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;

use crate::engine::params::ParamStore;
use crate::engine::types::{Direction, WorkflowRecord, WorkflowStatus, WorkflowSummary};
use crate::storage::{LockMode, ResourceLock, WorkflowStore, apply_lock, remove_holder};

/// In-memory workflow store. Holds state only for the lifetime of the
/// instance; used by tests and embedded callers that do not need durability.
pub struct MemoryWorkflowStore {
    records: Mutex<HashMap<String, WorkflowRecord>>,
    locks: Mutex<BTreeMap<String, ResourceLock>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            locks: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn create(&self, record: &WorkflowRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.id) {
            bail!("workflow already exists: {}", record.id);
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn record_step(
        &self,
        id: &str,
        direction: Direction,
        step_index: i32,
        working: &ParamStore,
        error: Option<&str>,
    ) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(id) else {
            bail!("workflow not found: {}", id);
        };
        record.direction = direction;
        record.step_index = step_index;
        record.working = working.clone();
        record.error = error.map(str::to_string);
        Ok(())
    }

    async fn complete(
        &self,
        id: &str,
        status: WorkflowStatus,
        working: &ParamStore,
        error: Option<&str>,
    ) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(id) else {
            bail!("workflow not found: {}", id);
        };
        // Idempotent: only a running workflow transitions out
        if record.status != WorkflowStatus::Running {
            return Ok(());
        }
        record.status = status;
        record.working = working.clone();
        record.error = error.map(str::to_string);
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<WorkflowSummary>> {
        let records = self.records.lock().unwrap();
        let mut summaries: Vec<WorkflowSummary> =
            records.values().map(WorkflowSummary::from).collect();
        summaries.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(summaries.into_iter().skip(offset).take(limit).collect())
    }

    async fn recover_running(&self) -> Result<Vec<WorkflowRecord>> {
        let records = self.records.lock().unwrap();
        let mut running: Vec<WorkflowRecord> = records
            .values()
            .filter(|r| r.status == WorkflowStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(running)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }

    async fn try_lock(&self, resource_id: &str, mode: LockMode, holder_id: &str) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        match apply_lock(locks.get(resource_id), resource_id, mode, holder_id) {
            Ok(updated) => {
                locks.insert(resource_id.to_string(), updated);
                Ok(true)
            }
            Err(()) => Ok(false),
        }
    }

    async fn unlock(&self, resource_id: &str, holder_id: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if let Some(lock) = locks.get(resource_id) {
            match remove_holder(lock, holder_id) {
                Some(updated) => {
                    locks.insert(resource_id.to_string(), updated);
                }
                None => {
                    locks.remove(resource_id);
                }
            }
        }
        Ok(())
    }

    async fn get_lock(&self, resource_id: &str) -> Result<Option<ResourceLock>> {
        Ok(self.locks.lock().unwrap().get(resource_id).cloned())
    }
}
