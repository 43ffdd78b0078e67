//! Dataset workflows: create, delete, and file ingest.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::locks::{LockResourceStep, UnlockResourceStep};
use crate::engine::params::ParamStore;
use crate::engine::step::{Step, WorkflowContext, WorkflowDefinition};
use crate::engine::types::{RetryPolicy, StepOutcome, WorkflowError};
use crate::services::{IamClient, ObjectStoreClient, Services, WarehouseClient};
use crate::storage::{LockMode, WorkflowStore};
use crate::workflows::{MintIdStep, dataset_resource};

pub const DATASET_ID: &str = "dataset_id";
pub const FILE_ID: &str = "file_id";

const METADATA_CREATED: &str = "dataset_metadata_created";
const BUCKET_CREATED: &str = "dataset_bucket_created";
const AUTHZ_CREATED: &str = "dataset_authz_created";
const FILE_WRITTEN: &str = "file_written";

/// Bucket naming is derived from the dataset name, so every step (and the
/// delete workflow) can recompute it without passing it around.
pub fn bucket_for(dataset_name: &str) -> String {
    format!("sf-dataset-{}", dataset_name)
}

pub fn create_definition(
    inputs: &ParamStore,
    services: &Services,
    store: &Arc<dyn WorkflowStore>,
) -> Result<WorkflowDefinition, WorkflowError> {
    let name: String = inputs.get("name")?;

    let mut definition = WorkflowDefinition::new("dataset_create");
    definition
        .add_step_with_retry(
            LockResourceStep::new(store.clone(), dataset_resource(&name), LockMode::Exclusive),
            RetryPolicy::lock_default(),
        )
        .add_step(MintIdStep::new(DATASET_ID))
        .add_step_with_retry(
            CreateDatasetMetadataStep::new(services.warehouse.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step_with_retry(
            CreateDatasetBucketStep::new(services.object_store.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step_with_retry(
            DatasetAuthzStep::new(services.iam.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step(DatasetCreateResponseStep::new(&name))
        .add_step(UnlockResourceStep::new(
            store.clone(),
            dataset_resource(&name),
            LockMode::Exclusive,
        ));
    Ok(definition)
}

pub fn delete_definition(
    inputs: &ParamStore,
    services: &Services,
    store: &Arc<dyn WorkflowStore>,
) -> Result<WorkflowDefinition, WorkflowError> {
    let name: String = inputs.get("name")?;

    let mut definition = WorkflowDefinition::new("dataset_delete");
    definition
        .add_step_with_retry(
            // Shared holders (a snapshot being cut from this dataset) block
            // the exclusive acquisition until they finish.
            LockResourceStep::new(store.clone(), dataset_resource(&name), LockMode::Exclusive),
            RetryPolicy::lock_default(),
        )
        .add_step(ValidateDatasetExistsStep::new(
            services.warehouse.clone(),
            &name,
        ))
        .add_step_with_retry(
            DeleteDatasetBucketStep::new(services.object_store.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step_with_retry(
            DeleteDatasetMetadataStep::new(services.warehouse.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step_with_retry(
            DeleteDatasetAuthzStep::new(services.iam.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step(DatasetDeleteResponseStep::new(&name))
        .add_step(UnlockResourceStep::new(
            store.clone(),
            dataset_resource(&name),
            LockMode::Exclusive,
        ));
    Ok(definition)
}

pub fn ingest_definition(
    inputs: &ParamStore,
    services: &Services,
    store: &Arc<dyn WorkflowStore>,
) -> Result<WorkflowDefinition, WorkflowError> {
    let dataset: String = inputs.get("dataset")?;
    let path: String = inputs.get("path")?;
    let contents: String = inputs.get("contents")?;

    let mut definition = WorkflowDefinition::new("file_ingest");
    definition
        .add_step_with_retry(
            LockResourceStep::new(store.clone(), dataset_resource(&dataset), LockMode::Exclusive),
            RetryPolicy::lock_default(),
        )
        .add_step(IngestValidateStep::new(
            services.warehouse.clone(),
            &dataset,
            &path,
        ))
        .add_step(MintIdStep::new(FILE_ID))
        .add_step_with_retry(
            IngestFileStep::new(services.object_store.clone(), &dataset, &path, &contents),
            RetryPolicy::service_default(),
        )
        .add_step(IngestResponseStep::new(&dataset, &path))
        .add_step(UnlockResourceStep::new(
            store.clone(),
            dataset_resource(&dataset),
            LockMode::Exclusive,
        ));
    Ok(definition)
}

// --- Create steps ---

/// Register the dataset in the warehouse.
pub struct CreateDatasetMetadataStep {
    warehouse: Arc<dyn WarehouseClient>,
    name: String,
}

impl CreateDatasetMetadataStep {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, name: &str) -> Self {
        Self {
            warehouse,
            name: name.to_string(),
        }
    }

    async fn run(&self, ctx: &mut WorkflowContext<'_>) -> Result<StepOutcome, WorkflowError> {
        let created: bool = ctx.working.get_opt(METADATA_CREATED)?.unwrap_or(false);

        match self.warehouse.dataset_exists(&self.name).await {
            Ok(true) if created => return Ok(StepOutcome::success()),
            Ok(true) => {
                // Pre-existing dataset, not our partial work: a name clash
                return Ok(ctx.fail_with_response(
                    409,
                    &json!({ "message": format!("dataset '{}' already exists", self.name) }),
                    format!("dataset '{}' already exists", self.name),
                ));
            }
            Ok(false) => {}
            Err(e) => return Ok(StepOutcome::retry(format!("{:#}", e))),
        }

        if let Err(e) = self.warehouse.create_dataset(&self.name).await {
            return Ok(StepOutcome::retry(format!("{:#}", e)));
        }
        ctx.working.put(METADATA_CREATED, &true)?;
        Ok(StepOutcome::success())
    }
}

#[async_trait]
impl Step for CreateDatasetMetadataStep {
    fn name(&self) -> &str {
        "create_dataset_metadata"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        self.run(ctx)
            .await
            .unwrap_or_else(|e| StepOutcome::fatal(e.to_string()))
    }

    async fn undo_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        // Only remove what this step created; a pre-existing dataset that
        // caused the 409 above must survive the unwind.
        let created: bool = match ctx.working.get_opt(METADATA_CREATED) {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => return StepOutcome::fatal(e.to_string()),
        };
        if !created {
            return StepOutcome::success();
        }
        match self.warehouse.delete_dataset(&self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }
}

/// Create the dataset's backing bucket.
pub struct CreateDatasetBucketStep {
    object_store: Arc<dyn ObjectStoreClient>,
    name: String,
}

impl CreateDatasetBucketStep {
    pub fn new(object_store: Arc<dyn ObjectStoreClient>, name: &str) -> Self {
        Self {
            object_store,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for CreateDatasetBucketStep {
    fn name(&self) -> &str {
        "create_dataset_bucket"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let bucket = bucket_for(&self.name);
        // The exclusive dataset lock means nobody else races on this bucket
        // name; finding it present means a previous attempt created it.
        match self.object_store.bucket_exists(&bucket).await {
            Ok(true) => return StepOutcome::success(),
            Ok(false) => {}
            Err(e) => return StepOutcome::retry(format!("{:#}", e)),
        }
        if let Err(e) = self.object_store.create_bucket(&bucket).await {
            return StepOutcome::retry(format!("{:#}", e));
        }
        if let Err(e) = ctx.working.put(BUCKET_CREATED, &true) {
            return StepOutcome::fatal(e.to_string());
        }
        StepOutcome::success()
    }

    async fn undo_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let created: bool = match ctx.working.get_opt(BUCKET_CREATED) {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => return StepOutcome::fatal(e.to_string()),
        };
        if !created {
            return StepOutcome::success();
        }
        match self.object_store.delete_bucket(&bucket_for(&self.name)).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }
}

/// Create the IAM resource that carries the dataset's access policies.
pub struct DatasetAuthzStep {
    iam: Arc<dyn IamClient>,
    name: String,
}

impl DatasetAuthzStep {
    pub fn new(iam: Arc<dyn IamClient>, name: &str) -> Self {
        Self {
            iam,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for DatasetAuthzStep {
    fn name(&self) -> &str {
        "dataset_authz"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        // A resource that is already there is adopted as-is; only one this
        // step creates itself gets the flag and becomes undoable.
        match self.iam.resource_exists("dataset", &self.name).await {
            Ok(true) => return StepOutcome::success(),
            Ok(false) => {}
            Err(e) => return StepOutcome::retry(format!("{:#}", e)),
        }
        if let Err(e) = self.iam.create_resource("dataset", &self.name).await {
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
        match self.iam.delete_resource("dataset", &self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }
}

/// Write the caller-visible payload for a successful create.
pub struct DatasetCreateResponseStep {
    name: String,
}

impl DatasetCreateResponseStep {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for DatasetCreateResponseStep {
    fn name(&self) -> &str {
        "dataset_create_response"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let result: Result<(), WorkflowError> = (|| {
            let id: String = ctx.working.get(DATASET_ID)?;
            ctx.working.set_response(
                201,
                &json!({
                    "id": id,
                    "name": self.name,
                    "bucket": bucket_for(&self.name),
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

// --- Delete steps ---

/// Fail fast with a 404 when the dataset is unknown.
pub struct ValidateDatasetExistsStep {
    warehouse: Arc<dyn WarehouseClient>,
    name: String,
}

impl ValidateDatasetExistsStep {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, name: &str) -> Self {
        Self {
            warehouse,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for ValidateDatasetExistsStep {
    fn name(&self) -> &str {
        "validate_dataset_exists"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.warehouse.dataset_exists(&self.name).await {
            Ok(true) => StepOutcome::success(),
            Ok(false) => ctx.fail_with_response(
                404,
                &json!({ "message": format!("dataset '{}' not found", self.name) }),
                format!("dataset '{}' not found", self.name),
            ),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

/// Delete the dataset's bucket. The undo cannot restore deleted data, so it
/// is a deliberate no-op; the delete steps sit behind the validation step so
/// an unwind from later failures never reaches back past real deletions.
pub struct DeleteDatasetBucketStep {
    object_store: Arc<dyn ObjectStoreClient>,
    name: String,
}

impl DeleteDatasetBucketStep {
    pub fn new(object_store: Arc<dyn ObjectStoreClient>, name: &str) -> Self {
        Self {
            object_store,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for DeleteDatasetBucketStep {
    fn name(&self) -> &str {
        "delete_dataset_bucket"
    }

    async fn do_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.object_store.delete_bucket(&bucket_for(&self.name)).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct DeleteDatasetMetadataStep {
    warehouse: Arc<dyn WarehouseClient>,
    name: String,
}

impl DeleteDatasetMetadataStep {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, name: &str) -> Self {
        Self {
            warehouse,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for DeleteDatasetMetadataStep {
    fn name(&self) -> &str {
        "delete_dataset_metadata"
    }

    async fn do_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.warehouse.delete_dataset(&self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct DeleteDatasetAuthzStep {
    iam: Arc<dyn IamClient>,
    name: String,
}

impl DeleteDatasetAuthzStep {
    pub fn new(iam: Arc<dyn IamClient>, name: &str) -> Self {
        Self {
            iam,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for DeleteDatasetAuthzStep {
    fn name(&self) -> &str {
        "delete_dataset_authz"
    }

    async fn do_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.iam.delete_resource("dataset", &self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct DatasetDeleteResponseStep {
    name: String,
}

impl DatasetDeleteResponseStep {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for DatasetDeleteResponseStep {
    fn name(&self) -> &str {
        "dataset_delete_response"
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

// --- Ingest steps ---

/// Validate the ingest request against current state before touching
/// anything: unknown dataset is a 404, an empty target path a 400.
pub struct IngestValidateStep {
    warehouse: Arc<dyn WarehouseClient>,
    dataset: String,
    path: String,
}

impl IngestValidateStep {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, dataset: &str, path: &str) -> Self {
        Self {
            warehouse,
            dataset: dataset.to_string(),
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl Step for IngestValidateStep {
    fn name(&self) -> &str {
        "ingest_validate"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        if self.path.trim().is_empty() {
            return ctx.fail_with_response(
                400,
                &json!({ "message": "target path must not be empty" }),
                "target path must not be empty",
            );
        }
        match self.warehouse.dataset_exists(&self.dataset).await {
            Ok(true) => StepOutcome::success(),
            Ok(false) => ctx.fail_with_response(
                404,
                &json!({ "message": format!("dataset '{}' not found", self.dataset) }),
                format!("dataset '{}' not found", self.dataset),
            ),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

/// Copy the file contents into the dataset's bucket.
pub struct IngestFileStep {
    object_store: Arc<dyn ObjectStoreClient>,
    dataset: String,
    path: String,
    contents: String,
}

impl IngestFileStep {
    pub fn new(
        object_store: Arc<dyn ObjectStoreClient>,
        dataset: &str,
        path: &str,
        contents: &str,
    ) -> Self {
        Self {
            object_store,
            dataset: dataset.to_string(),
            path: path.to_string(),
            contents: contents.to_string(),
        }
    }

    async fn run(&self, ctx: &mut WorkflowContext<'_>) -> Result<StepOutcome, WorkflowError> {
        let bucket = bucket_for(&self.dataset);
        let written: bool = ctx.working.get_opt(FILE_WRITTEN)?.unwrap_or(false);

        match self.object_store.object_exists(&bucket, &self.path).await {
            Ok(true) if written => return Ok(StepOutcome::success()),
            Ok(true) => {
                return Ok(ctx.fail_with_response(
                    409,
                    &json!({ "message": format!("object '{}' already exists", self.path) }),
                    format!("object '{}' already exists", self.path),
                ));
            }
            Ok(false) => {}
            Err(e) => return Ok(StepOutcome::retry(format!("{:#}", e))),
        }

        if let Err(e) = self
            .object_store
            .put_object(&bucket, &self.path, self.contents.as_bytes())
            .await
        {
            return Ok(StepOutcome::retry(format!("{:#}", e)));
        }
        ctx.working.put(FILE_WRITTEN, &true)?;
        Ok(StepOutcome::success())
    }
}

#[async_trait]
impl Step for IngestFileStep {
    fn name(&self) -> &str {
        "ingest_file"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        self.run(ctx)
            .await
            .unwrap_or_else(|e| StepOutcome::fatal(e.to_string()))
    }

    async fn undo_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let written: bool = match ctx.working.get_opt(FILE_WRITTEN) {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => return StepOutcome::fatal(e.to_string()),
        };
        if !written {
            return StepOutcome::success();
        }
        match self
            .object_store
            .delete_object(&bucket_for(&self.dataset), &self.path)
            .await
        {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }
}

pub struct IngestResponseStep {
    dataset: String,
    path: String,
}

impl IngestResponseStep {
    pub fn new(dataset: &str, path: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl Step for IngestResponseStep {
    fn name(&self) -> &str {
        "ingest_response"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let result: Result<(), WorkflowError> = (|| {
            let file_id: String = ctx.working.get(FILE_ID)?;
            ctx.working.set_response(
                200,
                &json!({
                    "file_id": file_id,
                    "dataset": self.dataset,
                    "path": self.path,
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
