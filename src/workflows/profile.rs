//! Billing profile workflows: create and delete.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::locks::{LockResourceStep, UnlockResourceStep};
use crate::engine::params::ParamStore;
use crate::engine::step::{Step, WorkflowContext, WorkflowDefinition};
use crate::engine::types::{RetryPolicy, StepOutcome, WorkflowError};
use crate::services::{IamClient, Services};
use crate::storage::{LockMode, WorkflowStore};
use crate::workflows::{MintIdStep, profile_resource};

pub const PROFILE_ID: &str = "profile_id";

const AUTHZ_CREATED: &str = "profile_authz_created";

pub fn create_definition(
    inputs: &ParamStore,
    services: &Services,
    store: &Arc<dyn WorkflowStore>,
) -> Result<WorkflowDefinition, WorkflowError> {
    let name: String = inputs.get("name")?;
    let billing_account: String = inputs.get("billing_account")?;

    let mut definition = WorkflowDefinition::new("profile_create");
    definition
        .add_step(ValidateBillingAccountStep::new(&billing_account))
        .add_step_with_retry(
            LockResourceStep::new(store.clone(), profile_resource(&name), LockMode::Exclusive),
            RetryPolicy::lock_default(),
        )
        .add_step(MintIdStep::new(PROFILE_ID))
        .add_step_with_retry(
            CreateProfileAuthzStep::new(services.iam.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step(ProfileCreateResponseStep::new(&name, &billing_account))
        .add_step(UnlockResourceStep::new(
            store.clone(),
            profile_resource(&name),
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

    let mut definition = WorkflowDefinition::new("profile_delete");
    definition
        .add_step_with_retry(
            LockResourceStep::new(store.clone(), profile_resource(&name), LockMode::Exclusive),
            RetryPolicy::lock_default(),
        )
        .add_step(ValidateProfileExistsStep::new(services.iam.clone(), &name))
        .add_step_with_retry(
            DeleteProfileAuthzStep::new(services.iam.clone(), &name),
            RetryPolicy::service_default(),
        )
        .add_step(ProfileDeleteResponseStep::new(&name))
        .add_step(UnlockResourceStep::new(
            store.clone(),
            profile_resource(&name),
            LockMode::Exclusive,
        ));
    Ok(definition)
}

/// Billing account ids look like `XXXXXX-XXXXXX-XXXXXX`: three groups of six
/// uppercase alphanumerics.
pub fn billing_account_is_valid(account: &str) -> bool {
    let groups: Vec<&str> = account.split('-').collect();
    groups.len() == 3
        && groups.iter().all(|g| {
            g.len() == 6
                && g.chars()
                    .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        })
}

/// Reject malformed billing account ids before any resource is touched.
pub struct ValidateBillingAccountStep {
    billing_account: String,
}

impl ValidateBillingAccountStep {
    pub fn new(billing_account: &str) -> Self {
        Self {
            billing_account: billing_account.to_string(),
        }
    }
}

#[async_trait]
impl Step for ValidateBillingAccountStep {
    fn name(&self) -> &str {
        "validate_billing_account"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        if billing_account_is_valid(&self.billing_account) {
            StepOutcome::success()
        } else {
            ctx.fail_with_response(
                400,
                &json!({
                    "message": format!(
                        "invalid billing account '{}': expected XXXXXX-XXXXXX-XXXXXX",
                        self.billing_account
                    )
                }),
                format!("invalid billing account '{}'", self.billing_account),
            )
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct CreateProfileAuthzStep {
    iam: Arc<dyn IamClient>,
    name: String,
}

impl CreateProfileAuthzStep {
    pub fn new(iam: Arc<dyn IamClient>, name: &str) -> Self {
        Self {
            iam,
            name: name.to_string(),
        }
    }

    async fn run(&self, ctx: &mut WorkflowContext<'_>) -> Result<StepOutcome, WorkflowError> {
        // The IAM resource doubles as the profile's existence marker, so a
        // clash here is a duplicate profile rather than partial work.
        let created: bool = ctx.working.get_opt(AUTHZ_CREATED)?.unwrap_or(false);
        match self.iam.resource_exists("profile", &self.name).await {
            Ok(true) if created => return Ok(StepOutcome::success()),
            Ok(true) => {
                return Ok(ctx.fail_with_response(
                    409,
                    &json!({ "message": format!("profile '{}' already exists", self.name) }),
                    format!("profile '{}' already exists", self.name),
                ));
            }
            Ok(false) => {}
            Err(e) => return Ok(StepOutcome::retry(format!("{:#}", e))),
        }
        if let Err(e) = self.iam.create_resource("profile", &self.name).await {
            return Ok(StepOutcome::retry(format!("{:#}", e)));
        }
        ctx.working.put(AUTHZ_CREATED, &true)?;
        Ok(StepOutcome::success())
    }
}

#[async_trait]
impl Step for CreateProfileAuthzStep {
    fn name(&self) -> &str {
        "create_profile_authz"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        self.run(ctx)
            .await
            .unwrap_or_else(|e| StepOutcome::fatal(e.to_string()))
    }

    async fn undo_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let created: bool = match ctx.working.get_opt(AUTHZ_CREATED) {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => return StepOutcome::fatal(e.to_string()),
        };
        if !created {
            return StepOutcome::success();
        }
        match self.iam.delete_resource("profile", &self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }
}

pub struct ProfileCreateResponseStep {
    name: String,
    billing_account: String,
}

impl ProfileCreateResponseStep {
    pub fn new(name: &str, billing_account: &str) -> Self {
        Self {
            name: name.to_string(),
            billing_account: billing_account.to_string(),
        }
    }
}

#[async_trait]
impl Step for ProfileCreateResponseStep {
    fn name(&self) -> &str {
        "profile_create_response"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        let result: Result<(), WorkflowError> = (|| {
            let id: String = ctx.working.get(PROFILE_ID)?;
            ctx.working.set_response(
                201,
                &json!({
                    "id": id,
                    "name": self.name,
                    "billing_account": self.billing_account,
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

pub struct ValidateProfileExistsStep {
    iam: Arc<dyn IamClient>,
    name: String,
}

impl ValidateProfileExistsStep {
    pub fn new(iam: Arc<dyn IamClient>, name: &str) -> Self {
        Self {
            iam,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for ValidateProfileExistsStep {
    fn name(&self) -> &str {
        "validate_profile_exists"
    }

    async fn do_step(&self, ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.iam.resource_exists("profile", &self.name).await {
            Ok(true) => StepOutcome::success(),
            Ok(false) => ctx.fail_with_response(
                404,
                &json!({ "message": format!("profile '{}' not found", self.name) }),
                format!("profile '{}' not found", self.name),
            ),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct DeleteProfileAuthzStep {
    iam: Arc<dyn IamClient>,
    name: String,
}

impl DeleteProfileAuthzStep {
    pub fn new(iam: Arc<dyn IamClient>, name: &str) -> Self {
        Self {
            iam,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for DeleteProfileAuthzStep {
    fn name(&self) -> &str {
        "delete_profile_authz"
    }

    async fn do_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        match self.iam.delete_resource("profile", &self.name).await {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::retry(format!("{:#}", e)),
        }
    }

    async fn undo_step(&self, _ctx: &mut WorkflowContext<'_>) -> StepOutcome {
        StepOutcome::success()
    }
}

pub struct ProfileDeleteResponseStep {
    name: String,
}

impl ProfileDeleteResponseStep {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Step for ProfileDeleteResponseStep {
    fn name(&self) -> &str {
        "profile_delete_response"
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
