use axum::{
    Router,
    routing::{get, patch, post},
};

use crate::handlers::{callbacks, events, sessions, workers};
use crate::infra::app_state::AppState;

/// Create all v1 API routes.
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        // Client session endpoints (scoped to X-User-Id)
        .route(
            "/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route(
            "/sessions/{id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/sessions/{id}/log", get(sessions::session_log))
        .route("/sessions/{id}/events", get(events::session_events))
        // Signed worker callbacks
        .route("/callbacks/status", post(callbacks::status_callback))
        .route("/callbacks/checklist", post(callbacks::checklist_callback))
        .route("/callbacks/result", post(callbacks::result_callback))
        // Admin worker registry
        .route(
            "/admin/workers",
            post(workers::register_worker).get(workers::list_workers),
        )
        .route("/admin/workers/{id}", patch(workers::update_worker))
        .route(
            "/admin/workers/{id}/disable",
            post(workers::disable_worker),
        )
        .route(
            "/admin/metrics/callback-rejections",
            get(workers::callback_rejections),
        )
}
