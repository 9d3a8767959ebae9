//! HTTP/WebSocket control surface for workflow recording and playback.

pub mod api;
pub mod coordinator;
pub mod types;
pub mod utils;
pub mod websocket;

use axum::{
    routing::{delete, get},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use coordinator::{
    CoordinatorConfig, CoordinatorError, InteractionSource, PlaybackCoordinator, Transition,
};
pub use types::{ControlMessage, CoordinatorStatus, HealthResponse, Notification, Phase};

/// Builds the application router around a shared coordinator.
pub fn router(coordinator: Arc<PlaybackCoordinator>, cors: bool) -> Router {
    let mut app = Router::new()
        // Health check
        .route("/api/health", get(api::health))
        .route("/api/status", get(api::get_status))
        // Saved workflows
        .route("/api/workflows", get(api::list_workflows))
        .route("/api/workflows/{id}", delete(api::delete_workflow))
        // Control channel
        .route("/api/control", get(websocket::control_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator);

    if cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    app
}
