use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use autopilot::{AutomationError, Workflow};
use std::sync::Arc;
use tracing::info;

use crate::coordinator::PlaybackCoordinator;
use crate::types::{CoordinatorStatus, HealthResponse};

// ============================================================================
// Error Handling
// ============================================================================

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "error": self.message
            })),
        )
            .into_response()
    }
}

impl From<AutomationError> for ApiError {
    fn from(err: AutomationError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Health Check
// ============================================================================

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Status
// ============================================================================

pub async fn get_status(
    State(coordinator): State<Arc<PlaybackCoordinator>>,
) -> Json<CoordinatorStatus> {
    Json(coordinator.status().await)
}

// ============================================================================
// Saved Workflows
// ============================================================================

pub async fn list_workflows(
    State(coordinator): State<Arc<PlaybackCoordinator>>,
) -> Result<Json<Vec<Workflow>>, ApiError> {
    Ok(Json(coordinator.library().saved().await?))
}

pub async fn delete_workflow(
    State(coordinator): State<Arc<PlaybackCoordinator>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!("DELETE /api/workflows/{}", id);

    if coordinator.library().delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("No saved workflow with id {id}")))
    }
}
