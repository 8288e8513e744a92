//! `api` crate: HTTP REST API of a master.
//!
//! Exposes:
//!   POST   /api/v1/workflow-definitions
//!   POST   /api/v1/workflow-instances
//!   GET    /api/v1/workflow-instances/{id}
//!   POST   /api/v1/workflow-instances/{id}/operations
//!   POST   /api/v1/task-events
//!   GET    /healthz

pub mod error;
pub mod handlers;

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use engine::WorkflowCoordinator;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use handlers::{executions, task_events, workflows};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<WorkflowCoordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/workflow-definitions", post(workflows::create))
        .route("/api/v1/workflow-instances", post(executions::submit))
        .route("/api/v1/workflow-instances/:id", get(executions::get))
        .route(
            "/api/v1/workflow-instances/:id/operations",
            post(executions::operate),
        )
        .route("/api/v1/task-events", post(task_events::report))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn serve(
    bind: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
