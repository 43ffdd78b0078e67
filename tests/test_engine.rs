//! Integration tests for the orchestrator: forward execution, retry
//! handling, reverse unwinding, cancellation, and panic containment.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sagaflow::engine::locks::LockResourceStep;
use sagaflow::engine::orchestrator::Orchestrator;
use sagaflow::engine::step::{Step, WorkflowContext, WorkflowDefinition};
use sagaflow::engine::types::{
    CancelFlag, Direction, RetryPolicy, StepOutcome, WorkflowRecord, WorkflowStatus,
};
use sagaflow::engine::params::ParamStore;
use sagaflow::services::{IamClient as _, Services};
use sagaflow::storage::memory_store::MemoryWorkflowStore;
use sagaflow::storage::{LockMode, WorkflowStore};
use sagaflow::workflows::dataset::DatasetAuthzStep;
use sagaflow::workflows::snapshot::SnapshotAuthzStep;

/// Shared call log: "do:<name>" / "undo:<name>" entries in invocation order.
type CallLog = Arc<Mutex<Vec<String>>>;

/// Step whose forward outcomes follow a script; once the script is empty
/// every further invocation succeeds. Undo succeeds unless told otherwise.
struct ScriptedStep {
    name: String,
    log: CallLog,
    do_script: Mutex<VecDeque<StepOutcome>>,
    undo_outcome: Mutex<Option<StepOutcome>>,
}

impl ScriptedStep {
    fn ok(name: &str, log: &CallLog) -> Self {
        Self::scripted(name, log, vec![])
    }

    fn scripted(name: &str, log: &CallLog, outcomes: Vec<StepOutcome>) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            do_script: Mutex::new(outcomes.into()),
            undo_outcome: Mutex::new(None),
        }
    }

    fn with_undo(self, outcome: StepOutcome) -> Self {
        *self.undo_outcome.lock().unwrap() = Some(outcome);
        self
    }
}

#[async_trait]
impl Step for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn do_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        self.log.lock().unwrap().push(format!("do:{}", self.name));
        self.do_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(StepOutcome::success)
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        self.log.lock().unwrap().push(format!("undo:{}", self.name));
        self.undo_outcome
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(StepOutcome::success)
    }
}

struct PanickingStep;

#[async_trait]
impl Step for PanickingStep {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn do_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        panic!("boom");
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

async fn run(
    definition: &WorkflowDefinition,
    store: &Arc<dyn WorkflowStore>,
) -> (WorkflowStatus, WorkflowRecord) {
    run_with_cancel(definition, store, &CancelFlag::default()).await
}

async fn run_with_cancel(
    definition: &WorkflowDefinition,
    store: &Arc<dyn WorkflowStore>,
    cancel: &CancelFlag,
) -> (WorkflowStatus, WorkflowRecord) {
    let mut record = WorkflowRecord::new(definition.kind(), ParamStore::new());
    store.create(&record).await.unwrap();

    let orchestrator = Orchestrator::new(store.clone());
    let status = orchestrator
        .run(definition, &mut record, cancel)
        .await
        .unwrap();

    let persisted = store.get(&record.id).await.unwrap().unwrap();
    (status, persisted)
}

fn store() -> Arc<dyn WorkflowStore> {
    Arc::new(MemoryWorkflowStore::new())
}

// --- Forward execution ---

#[tokio::test]
async fn all_steps_succeed() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(ScriptedStep::ok("a", &log))
        .add_step(ScriptedStep::ok("b", &log))
        .add_step(ScriptedStep::ok("c", &log));

    let (status, record) = run(&definition, &store()).await;

    assert_eq!(status, WorkflowStatus::Success);
    assert_eq!(record.status, WorkflowStatus::Success);
    assert_eq!(record.step_index, 3);
    assert_eq!(record.direction, Direction::Doing);
    assert!(record.error.is_none());
    assert!(record.completed_at.is_some());
    assert_eq!(*log.lock().unwrap(), vec!["do:a", "do:b", "do:c"]);
}

// --- Unwinding ---

#[tokio::test]
async fn fatal_failure_unwinds_in_reverse_order() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(ScriptedStep::ok("a", &log))
        .add_step(ScriptedStep::ok("b", &log))
        .add_step(ScriptedStep::scripted(
            "c",
            &log,
            vec![StepOutcome::fatal("c exploded")],
        ));

    let (status, record) = run(&definition, &store()).await;

    assert_eq!(status, WorkflowStatus::Error);
    assert_eq!(record.direction, Direction::Undoing);
    assert_eq!(record.step_index, -1);
    assert_eq!(record.error.as_deref(), Some("c exploded"));
    // The failing step's own undo runs first, then the rest in reverse
    assert_eq!(
        *log.lock().unwrap(),
        vec!["do:a", "do:b", "do:c", "undo:c", "undo:b", "undo:a"]
    );
}

#[tokio::test]
async fn failed_undo_is_fatal_and_keeps_both_errors() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(ScriptedStep::ok("a", &log).with_undo(StepOutcome::fatal("undo broke")))
        .add_step(ScriptedStep::scripted(
            "b",
            &log,
            vec![StepOutcome::fatal("b exploded")],
        ));

    let (status, record) = run(&definition, &store()).await;

    assert_eq!(status, WorkflowStatus::Fatal);
    let error = record.error.unwrap();
    assert!(error.contains("b exploded"), "missing original: {}", error);
    assert!(error.contains("unwind failed"), "missing unwind: {}", error);
    assert!(error.contains("undo broke"), "missing undo cause: {}", error);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["do:a", "do:b", "undo:b", "undo:a"]
    );
}

// --- Retries ---

#[tokio::test]
async fn retry_then_success_within_budget() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(ScriptedStep::ok("a", &log))
        .add_step_with_retry(
            ScriptedStep::scripted(
                "flaky",
                &log,
                vec![
                    StepOutcome::retry("transient 1"),
                    StepOutcome::retry("transient 2"),
                ],
            ),
            RetryPolicy::Fixed {
                max_attempts: 3,
                interval_ms: 1,
            },
        )
        .add_step(ScriptedStep::ok("c", &log));

    let (status, _) = run(&definition, &store()).await;

    assert_eq!(status, WorkflowStatus::Success);
    // The flaky step ran exactly three times; its neighbors exactly once
    assert_eq!(
        *log.lock().unwrap(),
        vec!["do:a", "do:flaky", "do:flaky", "do:flaky", "do:c"]
    );
}

#[tokio::test]
async fn retry_budget_exhaustion_becomes_fatal() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition.add_step_with_retry(
        ScriptedStep::scripted(
            "flaky",
            &log,
            vec![
                StepOutcome::retry("still down"),
                StepOutcome::retry("still down"),
                StepOutcome::retry("still down"),
            ],
        ),
        RetryPolicy::Fixed {
            max_attempts: 2,
            interval_ms: 1,
        },
    );

    let (status, record) = run(&definition, &store()).await;

    assert_eq!(status, WorkflowStatus::Error);
    let error = record.error.unwrap();
    assert!(error.contains("retry budget exhausted"), "got: {}", error);
    assert!(error.contains("still down"), "got: {}", error);
    // Exactly max_attempts forward invocations, then the unwind
    assert_eq!(
        *log.lock().unwrap(),
        vec!["do:flaky", "do:flaky", "undo:flaky"]
    );
}

#[tokio::test]
async fn retry_without_policy_is_immediately_fatal() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition.add_step(ScriptedStep::scripted(
        "once",
        &log,
        vec![StepOutcome::retry("no budget")],
    ));

    let (status, record) = run(&definition, &store()).await;

    assert_eq!(status, WorkflowStatus::Error);
    assert!(record.error.unwrap().contains("retry budget exhausted"));
    assert_eq!(*log.lock().unwrap(), vec!["do:once", "undo:once"]);
}

// --- Cancellation ---

#[tokio::test]
async fn cancellation_unwinds_at_step_boundary() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(ScriptedStep::ok("a", &log))
        .add_step(ScriptedStep::ok("b", &log));

    let cancel = CancelFlag::default();
    cancel.cancel();
    let (status, record) = run_with_cancel(&definition, &store(), &cancel).await;

    assert_eq!(status, WorkflowStatus::Error);
    assert_eq!(record.error.as_deref(), Some("workflow cancelled"));
    // Flag was set before step 0 ran: no forward work, only the safe undo
    assert_eq!(*log.lock().unwrap(), vec!["undo:a"]);
}

// --- Lock interaction ---

#[tokio::test]
async fn contended_lock_exhausts_retries_and_unwinds() {
    let log: CallLog = Arc::default();
    let store = store();
    // Another workflow already holds the resource and never lets go
    assert!(
        store
            .try_lock("dataset/a", LockMode::Exclusive, "other-workflow")
            .await
            .unwrap()
    );

    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step_with_retry(
            LockResourceStep::new(store.clone(), "dataset/a", LockMode::Exclusive),
            RetryPolicy::Fixed {
                max_attempts: 2,
                interval_ms: 1,
            },
        )
        .add_step(ScriptedStep::ok("guarded", &log));

    let (status, record) = run(&definition, &store).await;

    assert_eq!(status, WorkflowStatus::Error);
    assert!(record.error.unwrap().contains("retry budget exhausted"));
    // The guarded step never ran, and the other holder is untouched
    assert!(log.lock().unwrap().is_empty());
    let lock = store.get_lock("dataset/a").await.unwrap().unwrap();
    assert_eq!(lock.holders, vec!["other-workflow"]);
}

#[tokio::test]
async fn fatal_unwind_leaves_lock_held() {
    let log: CallLog = Arc::default();
    let store = store();

    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(LockResourceStep::new(
            store.clone(),
            "dataset/a",
            LockMode::Exclusive,
        ))
        .add_step(
            ScriptedStep::scripted("b", &log, vec![StepOutcome::fatal("b exploded")])
                .with_undo(StepOutcome::fatal("undo broke")),
        );

    let (status, record) = run(&definition, &store).await;

    assert_eq!(status, WorkflowStatus::Fatal);
    // The unwind stopped before the lock step's undo: the resource stays
    // fenced until an operator intervenes
    let lock = store.get_lock("dataset/a").await.unwrap().unwrap();
    assert_eq!(lock.holders, vec![record.id.clone()]);
}

// --- Authz ownership across an unwind ---

#[tokio::test]
async fn unwind_removes_authz_resource_it_created() {
    let log: CallLog = Arc::default();
    let services = Services::in_memory();

    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(DatasetAuthzStep::new(services.iam.clone(), "orders"))
        .add_step(ScriptedStep::scripted(
            "b",
            &log,
            vec![StepOutcome::fatal("b exploded")],
        ));

    let (status, _) = run(&definition, &store()).await;

    assert_eq!(status, WorkflowStatus::Error);
    assert!(!services.iam.resource_exists("dataset", "orders").await.unwrap());
}

#[tokio::test]
async fn unwind_keeps_adopted_authz_resources() {
    let log: CallLog = Arc::default();
    let services = Services::in_memory();
    // Both resources predate the workflow; its rollback must not take them
    services.iam.create_resource("dataset", "orders").await.unwrap();
    services.iam.create_resource("snapshot", "v1").await.unwrap();

    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(DatasetAuthzStep::new(services.iam.clone(), "orders"))
        .add_step(SnapshotAuthzStep::new(services.iam.clone(), "v1"))
        .add_step(ScriptedStep::scripted(
            "b",
            &log,
            vec![StepOutcome::fatal("b exploded")],
        ));

    let (status, _) = run(&definition, &store()).await;

    assert_eq!(status, WorkflowStatus::Error);
    assert!(services.iam.resource_exists("dataset", "orders").await.unwrap());
    assert!(services.iam.resource_exists("snapshot", "v1").await.unwrap());
}

// --- Panic containment ---

#[tokio::test]
async fn panicking_step_is_contained_as_fatal() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(ScriptedStep::ok("a", &log))
        .add_step(PanickingStep);

    let (status, record) = run(&definition, &store()).await;

    assert_eq!(status, WorkflowStatus::Error);
    let error = record.error.unwrap();
    assert!(error.contains("panicked"), "got: {}", error);
    assert!(error.contains("boom"), "got: {}", error);
    assert_eq!(*log.lock().unwrap(), vec!["do:a", "undo:a"]);
}

// --- Resume points ---

#[tokio::test]
async fn resumes_mid_flight_record_from_persisted_index() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(ScriptedStep::ok("a", &log))
        .add_step(ScriptedStep::ok("b", &log))
        .add_step(ScriptedStep::ok("c", &log));

    // A record persisted after steps 0 and 1 ran: the next invocation
    // must be step 2 only.
    let store = store();
    let mut record = WorkflowRecord::new("test", ParamStore::new());
    record.step_index = 2;
    store.create(&record).await.unwrap();

    let orchestrator = Orchestrator::new(store.clone());
    let status = orchestrator
        .run(&definition, &mut record, &CancelFlag::default())
        .await
        .unwrap();

    assert_eq!(status, WorkflowStatus::Success);
    assert_eq!(*log.lock().unwrap(), vec!["do:c"]);
}

#[tokio::test]
async fn resumes_mid_undo_record_and_finishes_rollback() {
    let log: CallLog = Arc::default();
    let mut definition = WorkflowDefinition::new("test");
    definition
        .add_step(ScriptedStep::ok("a", &log))
        .add_step(ScriptedStep::ok("b", &log))
        .add_step(ScriptedStep::ok("c", &log));

    let store = store();
    let mut record = WorkflowRecord::new("test", ParamStore::new());
    record.direction = Direction::Undoing;
    record.step_index = 1;
    record.error = Some("previous failure".to_string());
    store.create(&record).await.unwrap();

    let orchestrator = Orchestrator::new(store.clone());
    let status = orchestrator
        .run(&definition, &mut record, &CancelFlag::default())
        .await
        .unwrap();

    assert_eq!(status, WorkflowStatus::Error);
    assert_eq!(*log.lock().unwrap(), vec!["undo:b", "undo:a"]);
}
