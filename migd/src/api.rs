use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{FailureKind, HandshakeMessage, PodRecord};
use log::error;
use serde_json::json;

use crate::orchestrator::{MigrationError, Orchestrator};

pub fn create_router(state: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route(
            "/migrate/{deployment}/{origin_node}/{dest_node}",
            post(migrate),
        )
        .route("/migrate/{deployment}", axum::routing::delete(cancel))
        .route("/pods", get(list_pods))
        .route("/healthz", get(health))
        .route("/ready", get(health))
        .with_state(state)
}

impl IntoResponse for MigrationError {
    fn into_response(self) -> Response {
        let status = match &self {
            MigrationError::Invalid(_) => StatusCode::BAD_REQUEST,
            MigrationError::NotFound(_) => StatusCode::NOT_FOUND,
            MigrationError::Conflict(_) => StatusCode::CONFLICT,
            MigrationError::Step { .. } => StatusCode::BAD_GATEWAY,
            MigrationError::Aborted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!("[api] {self}");
        let completed = match &self {
            MigrationError::Step { completed, .. } => completed.clone(),
            _ => Vec::new(),
        };
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "retryable": self.kind() == FailureKind::Retryable,
            "compensated": completed,
        });
        (status, Json(body)).into_response()
    }
}

async fn register(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(msg): Json<HandshakeMessage>,
) -> Response {
    let name = msg.pod_name.clone();
    let reply = orchestrator.register_pod(msg).await;
    if reply.is_new {
        if let Some(record) = orchestrator.registry().get(&name).await {
            return (StatusCode::CREATED, Json(record)).into_response();
        }
    }
    (StatusCode::OK, Json(reply)).into_response()
}

async fn migrate(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path((deployment, origin_node, dest_node)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, MigrationError> {
    let report = orchestrator
        .migrate_pod(&deployment, &origin_node, &dest_node)
        .await?;
    Ok(Json(json!({ "success": true, "report": report })))
}

async fn cancel(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(deployment): Path<String>,
) -> StatusCode {
    if orchestrator.cancel_migration(&deployment).await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn list_pods(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Vec<PodRecord>> {
    Json(orchestrator.registry().list().await)
}

async fn health() -> &'static str {
    "ok"
}
