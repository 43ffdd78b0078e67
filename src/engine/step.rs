use async_trait::async_trait;
use serde::Serialize;

use crate::engine::params::ParamStore;
use crate::engine::types::{Direction, RetryPolicy, StepOutcome, WorkflowError};

/// The slice of a workflow record a step is allowed to see: frozen inputs,
/// the mutable working map, and enough identity to log and to hold locks.
pub struct WorkflowContext<'a> {
    pub workflow_id: &'a str,
    pub kind: &'a str,
    pub direction: Direction,
    pub step_index: i32,
    pub inputs: &'a ParamStore,
    pub working: &'a mut ParamStore,
}

impl WorkflowContext<'_> {
    /// Fail fatally with a user-facing payload. The façade surfaces exactly
    /// what gets written here, so validation failures should prefer this
    /// over a bare `StepOutcome::fatal`.
    pub fn fail_with_response<T: Serialize>(
        &mut self,
        status_code: u16,
        payload: &T,
        error: impl Into<String>,
    ) -> StepOutcome {
        if let Err(e) = self.working.set_response(status_code, payload) {
            return StepOutcome::fatal(format!("failed to record error response: {}", e));
        }
        StepOutcome::fatal(error)
    }
}

/// A single compensable unit of work inside a workflow.
///
/// `do_step` must be idempotent under re-invocation with the same working
/// state: a crash may re-run it after its external effect partially or fully
/// happened. `undo_step` reverses this step's own forward effect only, and
/// must succeed even if `do_step` never ran.
#[async_trait]
pub trait Step: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome;

    async fn undo_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome;
}

pub(crate) struct StepEntry {
    pub step: Box<dyn Step>,
    pub retry: RetryPolicy,
}

/// Ordered list of steps for one workflow instance.
///
/// Definitions are assembled once at submission time from the workflow kind
/// and its inputs, and must be reproducible: the same inputs yield the same
/// step sequence, so a restarted engine can rebuild the definition and resume
/// from the persisted step index.
pub struct WorkflowDefinition {
    kind: String,
    steps: Vec<StepEntry>,
}

impl WorkflowDefinition {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            steps: Vec::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Append a step with no retries.
    pub fn add_step(&mut self, step: impl Step + 'static) -> &mut Self {
        self.add_boxed(Box::new(step), RetryPolicy::None)
    }

    /// Append a step with a retry policy for its `Retry` outcomes.
    pub fn add_step_with_retry(
        &mut self,
        step: impl Step + 'static,
        retry: RetryPolicy,
    ) -> &mut Self {
        self.add_boxed(Box::new(step), retry)
    }

    fn add_boxed(&mut self, step: Box<dyn Step>, retry: RetryPolicy) -> &mut Self {
        self.steps.push(StepEntry { step, retry });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|e| e.step.name()).collect()
    }

    pub(crate) fn entry(&self, index: i32) -> Result<&StepEntry, WorkflowError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.steps.get(i))
            .ok_or_else(|| {
                WorkflowError::InvalidState(format!(
                    "step index {} out of range for '{}' ({} steps)",
                    index,
                    self.kind,
                    self.steps.len()
                ))
            })
    }
}
