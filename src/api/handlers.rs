use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::engine::params::ParamStore;

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct SubmitRequest {
    /// Workflow kind, e.g. "dataset_create".
    pub kind: String,
    /// Input parameters for the workflow, a flat JSON object.
    #[serde(default)]
    pub inputs: serde_json::Value,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub id: String,
    pub status: String,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /workflows
pub async fn submit_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let inputs = ParamStore::from_value(req.inputs)?;
    let id = state.runner.submit(&req.kind, inputs).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id,
            status: "running".to_string(),
        }),
    ))
}

/// GET /workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let workflows = state.runner.list(params.offset, params.limit).await?;

    // count is the size of the returned page, not the store-wide total
    Ok(Json(serde_json::json!({
        "workflows": workflows,
        "count": workflows.len(),
    })))
}

/// GET /workflows/:id
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = state.runner.status(&id).await?;
    Ok(Json(serde_json::to_value(&record).map_err(|e| {
        AppError::Internal(anyhow::Error::from(e))
    })?))
}

/// GET /workflows/:id/result
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = state.runner.result(&id).await?;
    Ok(Json(serde_json::json!({
        "status_code": result.status_code,
        "response": result.response,
    })))
}

/// POST /workflows/:id/cancel
pub async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    state.runner.cancel(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "cancelling": id })),
    ))
}

/// DELETE /workflows/:id
pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.runner.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
