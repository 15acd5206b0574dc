use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use vmbroker_core::{WorkerRegistration, WorkerUpdate};
use vmbroker_model::{Worker, WorkerId, WorkerStatus, WorkerSummary};

use crate::errors::{AppError, AppResult};
use crate::infra::app_state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub label: Option<String>,
    pub base_address: String,
    pub max_concurrent_sessions: i32,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateWorkerRequest {
    pub label: Option<String>,
    pub base_address: Option<String>,
    pub max_concurrent_sessions: Option<i32>,
    pub status: Option<String>,
}

/// Register a worker. The response carries the signing credential exactly
/// once; it is never serialized again by any other endpoint.
pub async fn register_worker(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> AppResult<impl IntoResponse> {
    let worker = state
        .registry
        .register(WorkerRegistration {
            label: request.label,
            base_address: request.base_address,
            max_concurrent_sessions: request.max_concurrent_sessions,
        })
        .await?;

    let credential = worker.credential.clone();
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "worker": worker,
            "credential": credential,
        })),
    ))
}

pub async fn list_workers(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<WorkerSummary>>> {
    Ok(Json(state.registry.list().await?))
}

pub async fn update_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateWorkerRequest>,
) -> AppResult<Json<Worker>> {
    let status = match request.status.as_deref() {
        Some(raw) => Some(WorkerStatus::parse(raw).ok_or_else(|| {
            AppError::bad_request(format!("unknown worker status: {raw}"))
        })?),
        None => None,
    };

    let worker = state
        .registry
        .update(
            WorkerId::from(id),
            WorkerUpdate {
                label: request.label,
                base_address: request.base_address,
                max_concurrent_sessions: request.max_concurrent_sessions,
                status,
            },
        )
        .await?;
    Ok(Json(worker))
}

pub async fn disable_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Worker>> {
    Ok(Json(state.registry.disable(WorkerId::from(id)).await?))
}

/// Monotonic counters of rejected callback envelopes, split by reason, for
/// anomaly monitoring.
pub async fn callback_rejections(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let snapshot = state.authenticator.rejections();
    Json(json!({
        "unknown_worker": snapshot.unknown_worker,
        "stale_timestamp": snapshot.stale_timestamp,
        "bad_signature": snapshot.bad_signature,
    }))
}
