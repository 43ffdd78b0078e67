mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::runner::WorkflowRunner;
use crate::services::Services;
use crate::storage::json_store::JsonWorkflowStore;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub runner: WorkflowRunner,
}

/// Build the application router. Split out from `serve` so tests can drive
/// it directly.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/workflows", post(handlers::submit_workflow))
        .route("/workflows", get(handlers::list_workflows))
        .route("/workflows/{id}", get(handlers::get_workflow))
        .route("/workflows/{id}", delete(handlers::delete_workflow))
        .route("/workflows/{id}/result", get(handlers::get_result))
        .route("/workflows/{id}/cancel", post(handlers::cancel_workflow))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server, recovering any interrupted workflows first.
pub async fn serve(
    host: &str,
    port: u16,
    store_dir: PathBuf,
    services: Services,
    max_concurrent: Option<usize>,
) -> Result<()> {
    let store = Arc::new(JsonWorkflowStore::new(store_dir));
    let runner = WorkflowRunner::new(store, services, max_concurrent);

    let resumed = runner.recover().await?;
    if resumed > 0 {
        info!(resumed, "Resumed interrupted workflows");
    }

    let state = Arc::new(AppState { runner });
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Sagaflow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
