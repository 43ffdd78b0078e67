//! Tests for the REST API, driving the router directly with oneshot
//! requests.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use sagaflow::api::{AppState, router};
use sagaflow::engine::runner::WorkflowRunner;
use sagaflow::services::Services;
use sagaflow::storage::WorkflowStore;
use sagaflow::storage::memory_store::MemoryWorkflowStore;
use serde_json::{Value, json};
use tower::ServiceExt;

fn app() -> Router {
    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryWorkflowStore::new());
    let runner = WorkflowRunner::new(store, Services::in_memory(), Some(4));
    router(Arc::new(AppState { runner }))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Poll the status endpoint until the workflow is terminal.
async fn wait_terminal(app: &Router, id: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = send(app, get(&format!("/workflows/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] != "running" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("workflow {} never reached a terminal status", id);
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app();
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn submit_runs_workflow_to_result() {
    let app = app();

    let (status, body) = send(
        &app,
        post_json(
            "/workflows",
            json!({ "kind": "dataset_create", "inputs": { "name": "orders" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "running");
    let id = body["id"].as_str().unwrap().to_string();

    let record = wait_terminal(&app, &id).await;
    assert_eq!(record["status"], "success");
    assert_eq!(record["kind"], "dataset_create");

    let (status, body) = send(&app, get(&format!("/workflows/{}/result", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 201);
    assert_eq!(body["response"]["name"], "orders");
}

#[tokio::test]
async fn submit_unknown_kind_is_bad_request() {
    let app = app();
    let (status, body) = send(
        &app,
        post_json("/workflows", json!({ "kind": "nope", "inputs": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("unknown workflow kind"));
}

#[tokio::test]
async fn submit_non_object_inputs_is_bad_request() {
    let app = app();
    let (status, _) = send(
        &app,
        post_json("/workflows", json!({ "kind": "dataset_create", "inputs": [1, 2] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_unknown_workflow_is_not_found() {
    let app = app();
    let (status, _) = send(&app, get("/workflows/no-such-id")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, get("/workflows/no-such-id/result")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_returns_submitted_workflows() {
    let app = app();

    let (_, body) = send(
        &app,
        post_json(
            "/workflows",
            json!({ "kind": "profile_create",
                    "inputs": { "name": "team-a", "billing_account": "ABC123-DEF456-GHI789" } }),
        ),
    )
    .await;
    let id = body["id"].as_str().unwrap().to_string();
    wait_terminal(&app, &id).await;

    let (status, body) = send(&app, get("/workflows?offset=0&limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["workflows"][0]["id"], id.as_str());
    assert_eq!(body["workflows"][0]["kind"], "profile_create");
}

#[tokio::test]
async fn failed_workflow_result_carries_error_payload() {
    let app = app();

    let (_, body) = send(
        &app,
        post_json(
            "/workflows",
            json!({ "kind": "dataset_delete", "inputs": { "name": "ghost" } }),
        ),
    )
    .await;
    let id = body["id"].as_str().unwrap().to_string();

    let record = wait_terminal(&app, &id).await;
    assert_eq!(record["status"], "error");

    let (status, body) = send(&app, get(&format!("/workflows/{}/result", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 404);
}

#[tokio::test]
async fn delete_terminal_workflow_only() {
    let app = app();

    let (_, body) = send(
        &app,
        post_json(
            "/workflows",
            json!({ "kind": "dataset_create", "inputs": { "name": "orders" } }),
        ),
    )
    .await;
    let id = body["id"].as_str().unwrap().to_string();
    wait_terminal(&app, &id).await;

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/workflows/{}", id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], id.as_str());

    let (status, _) = send(&app, get(&format!("/workflows/{}", id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_of_terminal_workflow_is_conflict() {
    let app = app();

    let (_, body) = send(
        &app,
        post_json(
            "/workflows",
            json!({ "kind": "dataset_create", "inputs": { "name": "orders" } }),
        ),
    )
    .await;
    let id = body["id"].as_str().unwrap().to_string();
    wait_terminal(&app, &id).await;
    // Give the worker task a moment to retire its in-flight entry
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, _) = send(
        &app,
        post_json(&format!("/workflows/{}/cancel", id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
