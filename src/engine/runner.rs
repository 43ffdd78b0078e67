use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::engine::orchestrator::Orchestrator;
use crate::engine::params::ParamStore;
use crate::engine::step::WorkflowDefinition;
use crate::engine::types::{
    CancelFlag, JobResult, WorkflowError, WorkflowRecord, WorkflowStatus, WorkflowSummary,
};
use crate::services::Services;
use crate::storage::WorkflowStore;
use crate::workflows::{WorkflowKind, build_definition};

/// How often `await_completion` re-reads the store while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Submission and query façade over the orchestrator.
///
/// Runs many workflows concurrently on a bounded pool — one tokio task per
/// in-flight workflow, steps strictly sequential within each — and owns
/// crash recovery: on startup it rebuilds definitions for records still
/// marked running and resumes them at their persisted step.
pub struct WorkflowRunner {
    store: Arc<dyn WorkflowStore>,
    services: Services,
    semaphore: Arc<tokio::sync::Semaphore>,
    inflight: Arc<Mutex<HashMap<String, CancelFlag>>>,
}

impl WorkflowRunner {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        services: Services,
        max_concurrent: Option<usize>,
    ) -> Self {
        let max_concurrent = max_concurrent
            .or_else(|| {
                std::env::var("SAGAFLOW_MAX_CONCURRENT_WORKFLOWS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or_else(num_cpus::get);

        Self {
            store,
            services,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent)),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> Arc<dyn WorkflowStore> {
        self.store.clone()
    }

    /// Build the definition for `kind`, persist a new running record, hand it
    /// to the pool, and return the workflow id immediately.
    pub async fn submit(&self, kind: &str, inputs: ParamStore) -> Result<String, WorkflowError> {
        let kind: WorkflowKind = kind.parse()?;
        let definition = build_definition(kind, &inputs, &self.services, &self.store)?;
        let record = WorkflowRecord::new(&kind.to_string(), inputs);
        let id = record.id.clone();

        info!(
            workflow_id = %id,
            kind = %kind,
            steps = definition.len(),
            "Submitting workflow"
        );
        self.store.create(&record).await?;
        self.launch(definition, record);
        Ok(id)
    }

    /// Reload workflows that were running when the process died, rebuild
    /// their definitions from the frozen inputs, and resume them at the
    /// persisted (direction, step_index, working) triple. Returns how many
    /// were resumed.
    pub async fn recover(&self) -> Result<usize, WorkflowError> {
        let records = self.store.recover_running().await?;
        let mut resumed = 0;

        for record in records {
            let kind: WorkflowKind = match record.kind.parse() {
                Ok(kind) => kind,
                Err(e) => {
                    error!(workflow_id = %record.id, kind = %record.kind, error = %e,
                        "Cannot recover workflow of unknown kind");
                    self.store
                        .complete(
                            &record.id,
                            WorkflowStatus::Fatal,
                            &record.working,
                            Some(&format!("recovery failed: {}", e)),
                        )
                        .await?;
                    continue;
                }
            };

            match build_definition(kind, &record.inputs, &self.services, &self.store) {
                Ok(definition) => {
                    info!(
                        workflow_id = %record.id,
                        kind = %record.kind,
                        direction = %record.direction,
                        step = record.step_index,
                        "Resuming recovered workflow"
                    );
                    self.launch(definition, record);
                    resumed += 1;
                }
                Err(e) => {
                    // Should not happen: inputs are frozen and were valid at
                    // submission. Surface rather than drop silently.
                    error!(workflow_id = %record.id, error = %e,
                        "Failed to rebuild workflow definition during recovery");
                    self.store
                        .complete(
                            &record.id,
                            WorkflowStatus::Fatal,
                            &record.working,
                            Some(&format!("recovery failed: {}", e)),
                        )
                        .await?;
                }
            }
        }

        Ok(resumed)
    }

    fn launch(&self, definition: WorkflowDefinition, mut record: WorkflowRecord) {
        let cancel = CancelFlag::default();
        let id = record.id.clone();
        self.inflight
            .lock()
            .unwrap()
            .insert(id.clone(), cancel.clone());

        let store = self.store.clone();
        let semaphore = self.semaphore.clone();
        let inflight = self.inflight.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.unwrap();
            let orchestrator = Orchestrator::new(store);
            if let Err(e) = orchestrator.run(&definition, &mut record, &cancel).await {
                // Storage failure mid-flight: leave the record as-is so a
                // later recovery pass can resume from the last durable step.
                error!(workflow_id = %id, error = %format!("{:#}", e),
                    "Workflow execution interrupted by storage failure");
            }
            inflight.lock().unwrap().remove(&id);
        });
    }

    /// Current state of a workflow.
    pub async fn status(&self, id: &str) -> Result<WorkflowRecord, WorkflowError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))
    }

    /// Block until the workflow reaches a terminal status, or time out.
    pub async fn await_completion(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<WorkflowRecord, WorkflowError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.status(id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WorkflowError::Timeout(id.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Result payload of a terminal workflow: the RESPONSE/STATUS_CODE the
    /// steps wrote, or a payload synthesized from the terminal error.
    pub async fn result(&self, id: &str) -> Result<JobResult, WorkflowError> {
        let record = self.status(id).await?;
        if !record.status.is_terminal() {
            return Err(WorkflowError::NotComplete(id.to_string()));
        }

        let status_code: Option<u16> = record.working.get_opt(ParamStore::STATUS_CODE)?;
        let response = record.working.get_value(ParamStore::RESPONSE).cloned();

        if let (Some(status_code), Some(response)) = (status_code, response) {
            return Ok(JobResult {
                status_code,
                response,
            });
        }

        match record.status {
            WorkflowStatus::Error | WorkflowStatus::Fatal => Ok(JobResult {
                status_code: 500,
                response: serde_json::json!({
                    "message": record
                        .error
                        .unwrap_or_else(|| "workflow failed".to_string()),
                    "status": record.status.to_string(),
                }),
            }),
            _ => Err(WorkflowError::InvalidState(format!(
                "workflow {} succeeded but produced no response payload",
                id
            ))),
        }
    }

    /// List workflows ordered by submission time ascending.
    pub async fn list(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<WorkflowSummary>, WorkflowError> {
        Ok(self.store.list(offset, limit).await?)
    }

    /// Request cooperative cancellation. Takes effect at the next step
    /// boundary; the workflow unwinds as if the current step failed fatally.
    pub async fn cancel(&self, id: &str) -> Result<(), WorkflowError> {
        if let Some(flag) = self.inflight.lock().unwrap().get(id) {
            warn!(workflow_id = %id, "Cancellation requested");
            flag.cancel();
            return Ok(());
        }

        let record = self.status(id).await?;
        Err(WorkflowError::InvalidState(format!(
            "workflow {} is {} and cannot be cancelled",
            id, record.status
        )))
    }

    /// Delete a terminal workflow record. Running workflows must be
    /// cancelled and unwound first.
    pub async fn delete(&self, id: &str) -> Result<(), WorkflowError> {
        let record = self.status(id).await?;
        if !record.status.is_terminal() {
            return Err(WorkflowError::InvalidState(format!(
                "cannot delete running workflow {}",
                id
            )));
        }
        Ok(self.store.delete(id).await?)
    }
}
