use crate::http::error::ApiError;
use crate::workers::{HealthStatus, WorkerManager};
use axum::extract::State;
use axum::{http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

/// Handler for GET /health
pub async fn health_handler() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "coursehub"
        })),
    )
}

/// Handler for GET /health/workers
///
/// Always returns the full status body; the status code is 503 whenever the
/// manager or any enabled worker is unhealthy.
pub async fn workers_status_handler(
    State(manager): State<Arc<WorkerManager>>,
) -> (StatusCode, Json<HealthStatus>) {
    let status = manager.health_status();
    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: u64,
}

/// Handler for POST /logs/cleanup
#[tracing::instrument(name = "handler_run_cleanup", skip(manager))]
pub async fn cleanup_handler(
    State(manager): State<Arc<WorkerManager>>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let deleted = manager.run_cleanup_now().await?;
    Ok(Json(CleanupResponse { deleted }))
}
