pub mod json_store;
pub mod memory_store;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::params::ParamStore;
use crate::engine::types::{Direction, WorkflowRecord, WorkflowStatus, WorkflowSummary};

/// Lock mode for a named resource.
///
/// At most one exclusive holder exists per resource, and an exclusive lock
/// excludes all shared holders (and vice versa). Shared holders may be many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Exclusive => write!(f, "exclusive"),
            LockMode::Shared => write!(f, "shared"),
        }
    }
}

/// One row of the resource lock table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: String,
    pub mode: LockMode,
    pub holders: Vec<String>,
}

/// Trait for durable workflow state and the resource lock table.
///
/// The engine persists after every single step transition; `record_step` is
/// the durability point a crashed engine resumes from. Lock state lives in
/// the same store but is independent of any one workflow record, so it
/// survives restarts and is visible to unrelated workflows.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert a newly submitted workflow. Fails if the id already exists.
    async fn create(&self, record: &WorkflowRecord) -> Result<()>;

    /// Persist one step transition: the (direction, step_index, working)
    /// triple names the next step the engine will invoke.
    async fn record_step(
        &self,
        id: &str,
        direction: Direction,
        step_index: i32,
        working: &ParamStore,
        error: Option<&str>,
    ) -> Result<()>;

    /// Mark a workflow terminal. Idempotent: only a running workflow
    /// transitions, repeated calls leave the record unchanged.
    async fn complete(
        &self,
        id: &str,
        status: WorkflowStatus,
        working: &ParamStore,
        error: Option<&str>,
    ) -> Result<()>;

    /// Point lookup by id.
    async fn get(&self, id: &str) -> Result<Option<WorkflowRecord>>;

    /// List workflows ordered by submission time ascending.
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<WorkflowSummary>>;

    /// All workflows still marked running, for restart recovery.
    async fn recover_running(&self) -> Result<Vec<WorkflowRecord>>;

    /// Remove a workflow record.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Try to acquire a lock on `resource_id` for `holder_id`.
    /// Compare-and-set semantics: returns false when the resource is held in
    /// a conflicting mode. Re-acquisition by the same holder is idempotent.
    async fn try_lock(&self, resource_id: &str, mode: LockMode, holder_id: &str) -> Result<bool>;

    /// Release `holder_id`'s lock on `resource_id`. No-op when not held.
    async fn unlock(&self, resource_id: &str, holder_id: &str) -> Result<()>;

    /// Current lock row for a resource, if any holder exists.
    async fn get_lock(&self, resource_id: &str) -> Result<Option<ResourceLock>>;
}

/// Shared lock-table logic for the in-process stores. Returns the updated
/// row (None = remove), or Err(()) when the request conflicts.
pub(crate) fn apply_lock(
    existing: Option<&ResourceLock>,
    resource_id: &str,
    mode: LockMode,
    holder_id: &str,
) -> std::result::Result<ResourceLock, ()> {
    match existing {
        None => Ok(ResourceLock {
            resource_id: resource_id.to_string(),
            mode,
            holders: vec![holder_id.to_string()],
        }),
        Some(lock) => {
            if lock.holders.iter().any(|h| h == holder_id) && lock.mode == mode {
                // Idempotent re-acquisition, e.g. a lock step re-run after a crash
                return Ok(lock.clone());
            }
            if lock.mode == LockMode::Shared && mode == LockMode::Shared {
                let mut updated = lock.clone();
                updated.holders.push(holder_id.to_string());
                return Ok(updated);
            }
            Err(())
        }
    }
}

pub(crate) fn remove_holder(lock: &ResourceLock, holder_id: &str) -> Option<ResourceLock> {
    let holders: Vec<String> = lock
        .holders
        .iter()
        .filter(|h| *h != holder_id)
        .cloned()
        .collect();
    if holders.is_empty() {
        None
    } else {
        Some(ResourceLock {
            resource_id: lock.resource_id.clone(),
            mode: lock.mode,
            holders,
        })
    }
}
