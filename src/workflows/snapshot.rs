//! Snapshot workflows: create and delete read-only views over a dataset.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::locks::{LockResourceStep, UnlockResourceStep};
use crate::engine::params::ParamStore;
use crate::engine::step::{Step, WorkflowContext, WorkflowDefinition};
use crate::engine::types::{RetryPolicy, StepOutcome, WorkflowError};
use crate::services::{IamClient, Services, WarehouseClient};
use crate::storage::{LockMode, WorkflowStore};
use crate::workflows::{MintIdStep, dataset_resource, snapshot_resource};

pub const SNAPSHOT_ID: &str = "snapshot_id";

const VIEW_CREATED: &str = "snapshot_view_created";
const AUTHZ_CREATED: &str = "snapshot_authz_created";

pub fn create_definition(
    inputs: &ParamStore,
    services: &Services,
    store: &Arc<dyn WorkflowStore>,
) -> Result<WorkflowDefinition, WorkflowError> {
    let name: String = inputs.get("name")?;
    let source: String = inputs.get("source_dataset")?;

    let mut definition = WorkflowDefinition::new("snapshot_create");
    definition
        // Shared on the source: concurrent snapshot creates from the same
        // dataset may interleave, but a dataset delete must wait them out.
        .add_step_with_retry(
            LockResourceStep::new(store.clone(), dataset_resource(&source), LockMode::Shared),
            RetryPolicy::lock_default(),
        )
        .add_step_with_retry(
            LockResourceStep::new(store.clone(), snapshot_resource(&name), LockMode::Exclusive),
            RetryPolicy::lock_default(),
        )
        .add_step(MintIdStep::new(SNAPSHOT_ID))
        .add_step_with_retry(
            CreateSnapshotViewStep::new(services.warehouse.clone(), &name, &source),
            RetryPolicy::service_default(),
        )
        .add_step_with_retry(
            SnapshotAuthzStep::new(services.iam.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step(SnapshotCreateResponseStep::new(&name, &source))
        .add_step(UnlockResourceStep::new(
            store.clone(),
            snapshot_resource(&name),
            LockMode::Exclusive,
        ))
        .add_step(UnlockResourceStep::new(
            store.clone(),
            dataset_resource(&source),
            LockMode::Shared,
        ));
    Ok(definition)
}

pub fn delete_definition(
    inputs: &ParamStore,
    services: &Services,
    store: &Arc<dyn WorkflowStore>,
) -> Result<WorkflowDefinition, WorkflowError> {
    let name: String = inputs.get("name")?;

    let mut definition = WorkflowDefinition::new("snapshot_delete");
    definition
        .add_step_with_retry(
            LockResourceStep::new(store.clone(), snapshot_resource(&name), LockMode::Exclusive),
            RetryPolicy::lock_default(),
        )
        .add_step(ValidateSnapshotExistsStep::new(
            services.warehouse.clone(),
            &name,
        ))
        .add_step_with_retry(
            DeleteSnapshotViewStep::new(services.warehouse.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step_with_retry(
            DeleteSnapshotAuthzStep::new(services.iam.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step(SnapshotDeleteResponseStep::new(&name))
        .add_step(UnlockResourceStep::new(
            store.clone(),
            snapshot_resource(&name),
            LockMode::Exclusive,
        ));
    Ok(definition)
}

/// Materialize the snapshot view in the warehouse.
pub struct CreateSnapshotViewStep {
    warehouse: Arc<dyn WarehouseClient>,
    name: String,
    source: String,
}

impl CreateSnapshotViewStep {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, name: &str, source: &str) -> Self {
        Self {
            warehouse,
            name: name.to_string(),
            source: source.to_string(),
        }
    }

    async fn run(&self, ctx: &mut WorkflowContext<'_>) -> Result<StepOutcome, WorkflowError> {
        // The shared lock on the source was taken two steps ago, but the
        // dataset may never have existed at all; surface that as a 404.
        match self.warehouse.dataset_exists(&self.source).await {
            Ok(true) => {}
            Ok(false) => {
                return Ok(ctx.fail_with_response(
                    404,
                    &json!({ "message": format!("source dataset '{}' not found", self.source) }),
                    format!("source dataset '{}' not found", self.source),
                ));
            }
            Err(e) => return Ok(StepOutcome::retry(format!("{:#}", e))),
        }

        let created: bool = ctx.working.get_opt(VIEW_CREATED)?.unwrap_or(false);
        match self.warehouse.snapshot_exists(&self.name).await {
            Ok(true) if created => return Ok(StepOutcome::success()),
            Ok(true) => {
                return Ok(ctx.fail_with_response(
                    409,
                    &json!({ "message": format!("snapshot '{}' already exists", self.name) }),
                    format!("snapshot '{}' already exists", self.name),
                ));
            }
            Ok(false) => {}
            Err(e) => return Ok(StepOutcome::retry(format!("{:#}", e))),
        }

        if let Err(e) = self
            .warehouse
            .create_snapshot_view(&self.name, &self.source)
            .await
        {
            return Ok(StepOutcome::retry(format!("{:#}", e)));
        }
        ctx.working.put(VIEW_CREATED, &true)?;
        Ok(StepOutcome::success())
    }
}

#[async_trait]
impl Step for CreateSnapshotViewStep {
    fn name(&self) -> &str {
        "create_snapshot_view"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        self.run(ctx)
            .await
            .unwrap_or_else(|e| StepOutcome::fatal(e.to_string()))
    }

    async fn undo_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let created: bool = match ctx.working.get_opt(VIEW_CREATED) {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => return StepOutcome::fatal(e.to_string()),
        };
        if !created {
            return StepOutcome::success();
        }
        match self.warehouse.delete_snapshot_view(&self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }
}

pub struct SnapshotAuthzStep {
    iam: Arc<dyn IamClient>,
    name: String,
}

impl SnapshotAuthzStep {
    pub fn new(iam: Arc<dyn IamClient>, name: &str) -> Self {
        Self {
            iam,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for SnapshotAuthzStep {
    fn name(&self) -> &str {
        "snapshot_authz"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        // Adopt a pre-existing resource without claiming ownership; only a
        // resource created here carries the flag and is undone.
        match self.iam.resource_exists("snapshot", &self.name).await {
            Ok(true) => return StepOutcome::success(),
            Ok(false) => {}
            Err(e) => return StepOutcome::retry(format!("{:#}", e)),
        }
        if let Err(e) = self.iam.create_resource("snapshot", &self.name).await {
            return StepOutcome::retry(format!("{:#}", e));
        }
        if let Err(e) = ctx.working.put(AUTHZ_CREATED, &true) {
            return StepOutcome::fatal(e.to_string());
        }
        StepOutcome::success()
    }

    async fn undo_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let created: bool = match ctx.working.get_opt(AUTHZ_CREATED) {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => return StepOutcome::fatal(e.to_string()),
        };
        if !created {
            return StepOutcome::success();
        }
        match self.iam.delete_resource("snapshot", &self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }
}

pub struct SnapshotCreateResponseStep {
    name: String,
    source: String,
}

impl SnapshotCreateResponseStep {
    pub fn new(name: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
        }
    }
}

#[async_trait]
impl Step for SnapshotCreateResponseStep {
    fn name(&self) -> &str {
        "snapshot_create_response"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let result: Result<(), WorkflowError> = (|| {
            let id: String = ctx.working.get(SNAPSHOT_ID)?;
            ctx.working.set_response(
                201,
                &json!({
                    "id": id,
                    "name": self.name,
                    "source_dataset": self.source,
                }),
            )
        })();
        match result {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::fatal(e.to_string()),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct ValidateSnapshotExistsStep {
    warehouse: Arc<dyn WarehouseClient>,
    name: String,
}

impl ValidateSnapshotExistsStep {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, name: &str) -> Self {
        Self {
            warehouse,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for ValidateSnapshotExistsStep {
    fn name(&self) -> &str {
        "validate_snapshot_exists"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.warehouse.snapshot_exists(&self.name).await {
            Ok(true) => StepOutcome::success(),
            Ok(false) => ctx.fail_with_response(
                404,
                &json!({ "message": format!("snapshot '{}' not found", self.name) }),
                format!("snapshot '{}' not found", self.name),
            ),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct DeleteSnapshotViewStep {
    warehouse: Arc<dyn WarehouseClient>,
    name: String,
}

impl DeleteSnapshotViewStep {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, name: &str) -> Self {
        Self {
            warehouse,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for DeleteSnapshotViewStep {
    fn name(&self) -> &str {
        "delete_snapshot_view"
    }

    async fn do_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.warehouse.delete_snapshot_view(&self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct DeleteSnapshotAuthzStep {
    iam: Arc<dyn IamClient>,
    name: String,
}

impl DeleteSnapshotAuthzStep {
    pub fn new(iam: Arc<dyn IamClient>, name: &str) -> Self {
        Self {
            iam,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for DeleteSnapshotAuthzStep {
    fn name(&self) -> &str {
        "delete_snapshot_authz"
    }

    async fn do_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.iam.delete_resource("snapshot", &self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct SnapshotDeleteResponseStep {
    name: String,
}

impl SnapshotDeleteResponseStep {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for SnapshotDeleteResponseStep {
    fn name(&self) -> &str {
        "snapshot_delete_response"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match ctx
            .working
            .set_response(200, &json!({ "deleted": self.name }))
        {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::fatal(e.to_string()),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}
