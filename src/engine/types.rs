use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::engine::params::ParamStore;

/// Status of a workflow instance.
///
/// `Error` means the workflow failed and fully unwound; `Fatal` means the
/// unwind itself failed and the underlying resources may be inconsistent.
/// The two are never conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Success,
    Error,
    Fatal,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Success => write!(f, "success"),
            WorkflowStatus::Error => write!(f, "error"),
            WorkflowStatus::Fatal => write!(f, "fatal"),
        }
    }
}

/// Direction of step execution. A workflow never returns to `Doing`
/// once it has switched to `Undoing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Doing,
    Undoing,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Doing => write!(f, "doing"),
            Direction::Undoing => write!(f, "undoing"),
        }
    }
}

/// Classification a step assigns to its own result. Steps map every raw
/// error onto `Retry` or `Fatal` before returning; the engine branches on
/// this status, never on error contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Retry,
    Fatal,
}

/// Outcome of one step invocation (forward or undo).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            status: StepStatus::Success,
            error: None,
        }
    }

    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Retry,
            error: Some(error.into()),
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Fatal,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// Retry policy applied by the engine when a step reports `Retry`.
/// Exhausting the policy converts the last retryable failure into a fatal one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "policy")]
pub enum RetryPolicy {
    /// No retries — the first `Retry` outcome is treated as fatal.
    None,
    /// Fixed interval between attempts.
    Fixed { max_attempts: u32, interval_ms: u64 },
    /// Exponential backoff: `initial_ms * factor^(attempt-1)`, capped at `max_ms`.
    Exponential {
        max_attempts: u32,
        initial_ms: u64,
        factor: f64,
        max_ms: u64,
    },
}

impl RetryPolicy {
    /// Default policy for resource lock acquisition; lock contention is
    /// expected and usually short-lived.
    pub fn lock_default() -> Self {
        RetryPolicy::Fixed {
            max_attempts: 10,
            interval_ms: 500,
        }
    }

    /// Default policy for steps that call external services.
    pub fn service_default() -> Self {
        RetryPolicy::Exponential {
            max_attempts: 5,
            initial_ms: 250,
            factor: 2.0,
            max_ms: 8_000,
        }
    }

    /// Backoff before the next attempt, given the number of attempts already
    /// made. `None` means the budget is exhausted.
    pub fn backoff(&self, attempts_made: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed {
                max_attempts,
                interval_ms,
            } => {
                if attempts_made >= max_attempts {
                    None
                } else {
                    Some(Duration::from_millis(interval_ms))
                }
            }
            RetryPolicy::Exponential {
                max_attempts,
                initial_ms,
                factor,
                max_ms,
            } => {
                if attempts_made >= max_attempts {
                    None
                } else {
                    let ms = initial_ms as f64 * factor.powi(attempts_made.saturating_sub(1) as i32);
                    Some(Duration::from_millis((ms as u64).min(max_ms)))
                }
            }
        }
    }
}

/// Persisted representation of one workflow instance.
///
/// `step_index` together with `direction` names the next step the engine will
/// invoke; during undo it reaches -1 once step 0 has been reversed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub kind: String,
    pub status: WorkflowStatus,
    pub direction: Direction,
    pub step_index: i32,
    pub inputs: ParamStore,
    pub working: ParamStore,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRecord {
    pub fn new(kind: &str, inputs: ParamStore) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            status: WorkflowStatus::Running,
            direction: Direction::Doing,
            step_index: 0,
            inputs,
            working: ParamStore::new(),
            submitted_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}

/// Listing view of a workflow, without the parameter stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub kind: String,
    pub status: WorkflowStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowRecord> for WorkflowSummary {
    fn from(record: &WorkflowRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind.clone(),
            status: record.status,
            submitted_at: record.submitted_at,
            completed_at: record.completed_at,
        }
    }
}

/// Result surfaced to the caller once a workflow is terminal: the payload the
/// last responsible step wrote into the working map, plus its status code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub status_code: u16,
    pub response: serde_json::Value,
}

/// Cooperative cancellation flag, checked by the engine at step boundaries
/// only. A running step is never preempted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Typed errors the façade distinguishes for callers.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow is not complete: {0}")]
    NotComplete(String),

    #[error("timed out waiting for workflow {0}")]
    Timeout(String),

    #[error("unknown workflow kind: {0}")]
    UnknownKind(String),

    #[error("invalid workflow state: {0}")]
    InvalidState(String),

    #[error("missing parameter: {0}")]
    MissingParam(String),

    #[error("invalid parameter '{key}': {message}")]
    InvalidParam { key: String, message: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
