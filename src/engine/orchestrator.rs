use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::FutureExt;
use tracing::{error, info, warn};

use crate::engine::step::{StepEntry, WorkflowContext, WorkflowDefinition};
use crate::engine::types::{
    CancelFlag, Direction, StepOutcome, StepStatus, WorkflowRecord, WorkflowStatus,
};
use crate::storage::WorkflowStore;

/// Result of one directional pass over the step list.
enum PassResult {
    /// Ran off the end (forward) or past step 0 (undo).
    Completed,
    /// A step failed fatally, or its retry budget ran out.
    Failed(String),
}

/// Drives one workflow record through its step list: forward until success,
/// backward through the compensating actions on fatal failure.
///
/// Every transition is persisted before the next step starts; the persisted
/// (direction, step_index, working) triple is the sole durability point, and
/// the orchestrator can be handed a recovered record mid-flight in either
/// direction.
pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Run the workflow to a terminal status and persist the completion.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        record: &mut WorkflowRecord,
        cancel: &CancelFlag,
    ) -> Result<WorkflowStatus> {
        info!(
            workflow_id = %record.id,
            kind = %record.kind,
            direction = %record.direction,
            step = record.step_index,
            "Starting workflow execution"
        );

        let status = self.fly(definition, record, cancel).await?;
        record.status = status;
        record.completed_at = Some(Utc::now());

        self.store
            .complete(&record.id, status, &record.working, record.error.as_deref())
            .await?;

        match status {
            WorkflowStatus::Fatal => error!(
                workflow_id = %record.id,
                kind = %record.kind,
                error = record.error.as_deref().unwrap_or("unknown"),
                "Workflow unwind failed; resources may be inconsistent and need operator attention"
            ),
            _ => info!(
                workflow_id = %record.id,
                kind = %record.kind,
                status = %status,
                "Workflow execution complete"
            ),
        }

        Ok(status)
    }

    /// Perform the workflow until all steps are done, the undo pass reaches
    /// the beginning, or the undo pass itself fails.
    async fn fly(
        &self,
        definition: &WorkflowDefinition,
        record: &mut WorkflowRecord,
        cancel: &CancelFlag,
    ) -> Result<WorkflowStatus> {
        // Part 1: running forward. Either we finish, or we record the failure
        // and fall through to the undo pass. A recovered record that was
        // already undoing skips this part entirely.
        if record.direction == Direction::Doing {
            match self.run_steps(definition, record, cancel).await? {
                PassResult::Completed => return Ok(WorkflowStatus::Success),
                PassResult::Failed(err) => {
                    warn!(
                        workflow_id = %record.id,
                        step = record.step_index,
                        error = %err,
                        "Step failed fatally; reversing direction"
                    );
                    // The failing step's own undo runs first: its forward
                    // action may have partially mutated external state.
                    record.error = Some(err);
                    record.direction = Direction::Undoing;
                    self.persist(record).await?;
                }
            }
        }

        // Part 2: running backward. Success here means a clean rollback and
        // we surface the original forward failure as ERROR.
        match self.run_steps(definition, record, cancel).await? {
            PassResult::Completed => Ok(WorkflowStatus::Error),
            PassResult::Failed(undo_err) => {
                record.error = Some(match record.error.take() {
                    Some(original) => format!("{}; unwind failed: {}", original, undo_err),
                    None => format!("unwind failed: {}", undo_err),
                });
                self.persist(record).await?;
                Ok(WorkflowStatus::Fatal)
            }
        }
    }

    /// Run steps in the record's current direction until the pass completes
    /// or a step fails. Each successful step advances the index and persists
    /// the new resume point before the next step may start.
    async fn run_steps(
        &self,
        definition: &WorkflowDefinition,
        record: &mut WorkflowRecord,
        cancel: &CancelFlag,
    ) -> Result<PassResult> {
        loop {
            match record.direction {
                Direction::Doing => {
                    if record.step_index >= definition.len() as i32 {
                        return Ok(PassResult::Completed);
                    }
                    // Cancellation is honored at step boundaries only, and
                    // only while doing: an unwind always runs to its end.
                    if cancel.is_cancelled() {
                        return Ok(PassResult::Failed("workflow cancelled".to_string()));
                    }
                }
                Direction::Undoing => {
                    if record.step_index < 0 {
                        return Ok(PassResult::Completed);
                    }
                }
            }

            let outcome = self.step_with_retry(definition, record).await?;
            if !outcome.is_success() {
                return Ok(PassResult::Failed(
                    outcome.error.unwrap_or_else(|| "step failed".to_string()),
                ));
            }

            record.step_index += match record.direction {
                Direction::Doing => 1,
                Direction::Undoing => -1,
            };
            self.persist(record).await?;
        }
    }

    /// Invoke the current step, retrying `Retry` outcomes under the step's
    /// policy. Budget exhaustion is converted into a fatal failure.
    async fn step_with_retry(
        &self,
        definition: &WorkflowDefinition,
        record: &mut WorkflowRecord,
    ) -> Result<StepOutcome> {
        let entry = definition.entry(record.step_index)?;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            info!(
                workflow_id = %record.id,
                step = record.step_index,
                name = entry.step.name(),
                direction = %record.direction,
                attempt = attempts,
                "Executing step"
            );

            let outcome = invoke(entry, record).await;

            match outcome.status {
                StepStatus::Success | StepStatus::Fatal => return Ok(outcome),
                StepStatus::Retry => {
                    let err = outcome.error.unwrap_or_else(|| "retryable failure".to_string());
                    match entry.retry.backoff(attempts) {
                        Some(delay) => {
                            warn!(
                                workflow_id = %record.id,
                                step = record.step_index,
                                name = entry.step.name(),
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Step reported retry; backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Ok(StepOutcome::fatal(format!(
                                "retry budget exhausted after {} attempt(s): {}",
                                attempts, err
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn persist(&self, record: &WorkflowRecord) -> Result<()> {
        self.store
            .record_step(
                &record.id,
                record.direction,
                record.step_index,
                &record.working,
                record.error.as_deref(),
            )
            .await
    }
}

/// Invoke do or undo based on direction, catching panics so a misbehaving
/// step surfaces as a fatal outcome instead of poisoning the worker task.
async fn invoke(entry: &StepEntry, record: &mut WorkflowRecord) -> StepOutcome {
    let direction = record.direction;
    let step_index = record.step_index;
    let mut ctx = WorkflowContext {
        workflow_id: &record.id,
        kind: &record.kind,
        direction,
        step_index,
        inputs: &record.inputs,
        working: &mut record.working,
    };

    let fut = async {
        match direction {
            Direction::Doing => entry.step.do_step(&mut ctx).await,
            Direction::Undoing => entry.step.undo_step(&mut ctx).await,
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            StepOutcome::fatal(format!(
                "step '{}' panicked: {}",
                entry.step.name(),
                message
            ))
        }
    }
}
