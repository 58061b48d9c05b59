use crate::workers::WorkerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error with HTTP status code
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: String,
}

impl ApiError {
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: "INTERNAL_SERVER_ERROR".to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
            code: "CONFLICT".to_string(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
            code: "SERVICE_UNAVAILABLE".to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "code": self.code,
            }
        }));

        (self.status, body).into_response()
    }
}

/// Convert WorkerError to ApiError
impl From<WorkerError> for ApiError {
    fn from(e: WorkerError) -> Self {
        let constructor = match &e {
            WorkerError::CleanupDisabled | WorkerError::AlreadyRunning { .. } => {
                ApiError::conflict
            }
            WorkerError::NotRunning { .. }
            | WorkerError::ShuttingDown
            | WorkerError::StillDraining { .. } => ApiError::service_unavailable,
            WorkerError::InvalidConfig { .. }
            | WorkerError::ShutdownTimeout { .. }
            | WorkerError::WorkerFailed { .. }
            | WorkerError::Sink(_) => ApiError::internal_error,
        };
        constructor(e.to_string())
    }
}
