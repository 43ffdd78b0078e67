use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::step::{Step, WorkflowContext};
use crate::engine::types::StepOutcome;
use crate::storage::{LockMode, WorkflowStore};

/// Acquire a lease on a named resource, held for the workflow's lifetime.
///
/// Placed early in a definition; the matching release is either this step's
/// undo (when the workflow unwinds) or an `UnlockResourceStep` placed late.
/// Contention yields `Retry`, bounded by the step's retry policy — a locked
/// resource is never silently proceeded past.
pub struct LockResourceStep {
    store: Arc<dyn WorkflowStore>,
    resource_id: String,
    mode: LockMode,
}

impl LockResourceStep {
    pub fn new(store: Arc<dyn WorkflowStore>, resource_id: impl Into<String>, mode: LockMode) -> Self {
        Self {
            store,
            resource_id: resource_id.into(),
            mode,
        }
    }
}

#[async_trait]
impl Step for LockResourceStep {
    fn name(&self) -> &str {
        "lock_resource"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self
            .store
            .try_lock(&self.resource_id, self.mode, ctx.workflow_id)
            .await
        {
            Ok(true) => StepOutcome::success(),
            Ok(false) => StepOutcome::retry(format!(
                "resource '{}' is locked by another workflow",
                self.resource_id
            )),
            Err(e) => StepOutcome::fatal(format!(
                "failed to acquire {} lock on '{}': {:#}",
                self.mode, self.resource_id, e
            )),
        }
    }

    async fn undo_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        // Safe when the forward action never acquired: unlock of a lock we
        // do not hold is a no-op.
        match self.store.unlock(&self.resource_id, ctx.workflow_id).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::fatal(format!(
                "failed to release lock on '{}': {:#}",
                self.resource_id, e
            )),
        }
    }
}

/// Release a lease acquired earlier in the same workflow.
///
/// The undo re-acquires the lock: if a later step's undo pass runs back
/// through here, the workflow must again hold the lease so the original
/// `LockResourceStep`'s undo performs the final release.
pub struct UnlockResourceStep {
    store: Arc<dyn WorkflowStore>,
    resource_id: String,
    mode: LockMode,
}

impl UnlockResourceStep {
    pub fn new(store: Arc<dyn WorkflowStore>, resource_id: impl Into<String>, mode: LockMode) -> Self {
        Self {
            store,
            resource_id: resource_id.into(),
            mode,
        }
    }
}

#[async_trait]
impl Step for UnlockResourceStep {
    fn name(&self) -> &str {
        "unlock_resource"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.store.unlock(&self.resource_id, ctx.workflow_id).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::fatal(format!(
                "failed to release lock on '{}': {:#}",
                self.resource_id, e
            )),
        }
    }

    async fn undo_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self
            .store
            .try_lock(&self.resource_id, self.mode, ctx.workflow_id)
            .await
        {
            Ok(true) => StepOutcome::success(),
            Ok(false) => StepOutcome::retry(format!(
                "resource '{}' was re-locked by another workflow",
                self.resource_id
            )),
            Err(e) => StepOutcome::fatal(format!(
                "failed to re-acquire lock on '{}': {:#}",
                self.resource_id, e
            )),
        }
    }
}
