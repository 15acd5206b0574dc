use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use vmbroker_core::NewSession;
use vmbroker_model::{Session, SessionId};

use crate::errors::{AppError, AppResult};
use crate::handlers::CallerId;
use crate::infra::app_state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub idempotency_key: String,
    pub provision_action: i32,
}

/// Create a session, or return the caller's existing session when the
/// idempotency key was already used. `201` means this request created the
/// session, `200` means it was replayed.
pub async fn create_session(
    State(state): State<AppState>,
    caller: CallerId,
    Json(request): Json<CreateSessionRequest>,
) -> AppResult<impl IntoResponse> {
    let idempotency_key = request.idempotency_key.trim().to_string();
    if idempotency_key.is_empty() {
        return Err(AppError::bad_request("idempotency_key must not be empty"));
    }

    let outcome = state
        .lifecycle
        .create(NewSession {
            id: SessionId::new(),
            user_id: caller.0,
            idempotency_key,
            provision_action: request.provision_action,
        })
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.session)))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    caller: CallerId,
) -> AppResult<Json<Vec<Session>>> {
    Ok(Json(state.lifecycle.list_for_user(caller.0).await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Session>> {
    let session = owned_session(&state, caller, id).await?;
    Ok(Json(session))
}

pub async fn delete_session(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let session = owned_session(&state, caller, id).await?;
    state.lifecycle.delete(session.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Proxy the worker's provisioning log for a session. The worker address
/// stays behind the orchestrator.
pub async fn session_log(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<Uuid>,
) -> AppResult<String> {
    let session = owned_session(&state, caller, id).await?;
    Ok(state.lifecycle.fetch_log(session.id).await?)
}

/// Fetch a session and check it belongs to the caller. Foreign sessions are
/// reported as not found so the endpoint leaks nothing about other users'
/// session ids.
pub(crate) async fn owned_session(
    state: &AppState,
    caller: CallerId,
    id: Uuid,
) -> AppResult<Session> {
    let session = state.lifecycle.get(SessionId::from(id)).await?;
    if session.user_id != caller.0 {
        return Err(AppError::not_found(format!("session {id} not found")));
    }
    Ok(session)
}
