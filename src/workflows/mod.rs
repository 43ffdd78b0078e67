pub mod dataset;
pub mod profile;
pub mod snapshot;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::engine::params::ParamStore;
use crate::engine::step::{Step, WorkflowContext, WorkflowDefinition};
use crate::engine::types::{StepOutcome, WorkflowError};
use crate::services::Services;
use crate::storage::WorkflowStore;

/// The mutating operations this service exposes. Each kind maps to one
/// deterministic workflow definition: the same inputs always produce the
/// same step sequence, which is what makes crash recovery possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
    DatasetCreate,
    DatasetDelete,
    FileIngest,
    SnapshotCreate,
    SnapshotDelete,
    ProfileCreate,
    ProfileDelete,
}

impl WorkflowKind {
    pub fn all() -> &'static [WorkflowKind] {
        &[
            WorkflowKind::DatasetCreate,
            WorkflowKind::DatasetDelete,
            WorkflowKind::FileIngest,
            WorkflowKind::SnapshotCreate,
            WorkflowKind::SnapshotDelete,
            WorkflowKind::ProfileCreate,
            WorkflowKind::ProfileDelete,
        ]
    }

    pub fn describe(&self) -> &'static str {
        match self {
            WorkflowKind::DatasetCreate => "Create a dataset with its bucket and access policy",
            WorkflowKind::DatasetDelete => "Delete a dataset and its resources",
            WorkflowKind::FileIngest => "Ingest a file into a dataset's bucket",
            WorkflowKind::SnapshotCreate => "Create a read-only snapshot view of a dataset",
            WorkflowKind::SnapshotDelete => "Delete a snapshot view",
            WorkflowKind::ProfileCreate => "Create a billing profile",
            WorkflowKind::ProfileDelete => "Delete a billing profile",
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowKind::DatasetCreate => "dataset_create",
            WorkflowKind::DatasetDelete => "dataset_delete",
            WorkflowKind::FileIngest => "file_ingest",
            WorkflowKind::SnapshotCreate => "snapshot_create",
            WorkflowKind::SnapshotDelete => "snapshot_delete",
            WorkflowKind::ProfileCreate => "profile_create",
            WorkflowKind::ProfileDelete => "profile_delete",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for WorkflowKind {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dataset_create" => Ok(WorkflowKind::DatasetCreate),
            "dataset_delete" => Ok(WorkflowKind::DatasetDelete),
            "file_ingest" => Ok(WorkflowKind::FileIngest),
            "snapshot_create" => Ok(WorkflowKind::SnapshotCreate),
            "snapshot_delete" => Ok(WorkflowKind::SnapshotDelete),
            "profile_create" => Ok(WorkflowKind::ProfileCreate),
            "profile_delete" => Ok(WorkflowKind::ProfileDelete),
            other => Err(WorkflowError::UnknownKind(other.to_string())),
        }
    }
}

/// Assemble the ordered step list for one workflow submission.
///
/// Collaborators are injected by reference here, never looked up by name at
/// runtime, so a definition that builds is a definition that is fully wired.
/// Input validation that can happen before any step runs happens here and
/// surfaces as a submission error.
pub fn build_definition(
    kind: WorkflowKind,
    inputs: &ParamStore,
    services: &Services,
    store: &Arc<dyn WorkflowStore>,
) -> Result<WorkflowDefinition, WorkflowError> {
    match kind {
        WorkflowKind::DatasetCreate => dataset::create_definition(inputs, services, store),
        WorkflowKind::DatasetDelete => dataset::delete_definition(inputs, services, store),
        WorkflowKind::FileIngest => dataset::ingest_definition(inputs, services, store),
        WorkflowKind::SnapshotCreate => snapshot::create_definition(inputs, services, store),
        WorkflowKind::SnapshotDelete => snapshot::delete_definition(inputs, services, store),
        WorkflowKind::ProfileCreate => profile::create_definition(inputs, services, store),
        WorkflowKind::ProfileDelete => profile::delete_definition(inputs, services, store),
    }
}

// Resource ids used by the lock table. Lock by name: the name is what two
// concurrent submissions race on, before any id has been minted.

pub fn dataset_resource(name: &str) -> String {
    format!("dataset/{}", name)
}

pub fn snapshot_resource(name: &str) -> String {
    format!("snapshot/{}", name)
}

pub fn profile_resource(name: &str) -> String {
    format!("profile/{}", name)
}

/// Mint a unique id into the working map under `key`.
///
/// Idempotent on re-run: if a previous attempt already minted the id, the
/// persisted working map keeps it and this step leaves it alone, so the id
/// is stable across crashes and retries.
pub struct MintIdStep {
    key: &'static str,
}

impl MintIdStep {
    pub fn new(key: &'static str) -> Self {
        Self { key }
    }
}

#[async_trait]
impl Step for MintIdStep {
    fn name(&self) -> &str {
        "mint_id"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        if ctx.working.contains(self.key) {
            return StepOutcome::success();
        }
        match ctx.working.put(self.key, &Uuid::new_v4().to_string()) {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::fatal(e.to_string()),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}
