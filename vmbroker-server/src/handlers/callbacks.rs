use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

use vmbroker_model::{
    ChecklistCallback, ResultCallback, StatusCallback, Worker, WorkerId,
};

use crate::errors::{AppError, AppResult};
use crate::infra::app_state::AppState;

const WORKER_ID_HEADER: &str = "x-worker-id";
const TIMESTAMP_HEADER: &str = "x-timestamp";
const SIGNATURE_HEADER: &str = "x-signature";

/// Verify the callback envelope and deserialize the body.
///
/// The signature covers the raw body bytes, so the body is taken as `Bytes`
/// and only parsed after verification succeeds. A missing or malformed
/// envelope gets the same response as a failed verification.
async fn authenticate<T: DeserializeOwned>(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> AppResult<(Worker, T)> {
    let rejected = || AppError::unauthorized("callback rejected");

    let worker_id = headers
        .get(WORKER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
        .map(WorkerId::from)
        .ok_or_else(rejected)?;
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(rejected)?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(rejected)?;

    let worker = state
        .authenticator
        .verify(worker_id, timestamp, signature, body)
        .await?;

    let payload = serde_json::from_slice(body)
        .map_err(|_| AppError::bad_request("invalid callback payload"))?;
    Ok((worker, payload))
}

pub async fn status_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let (worker, callback): (_, StatusCallback) =
        authenticate(&state, &headers, &body).await?;
    state.lifecycle.apply_status(&worker, callback).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn checklist_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let (worker, callback): (_, ChecklistCallback) =
        authenticate(&state, &headers, &body).await?;
    state.lifecycle.apply_checklist(&worker, callback).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn result_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let (worker, callback): (_, ResultCallback) =
        authenticate(&state, &headers, &body).await?;
    state.lifecycle.apply_result(&worker, callback).await?;
    Ok(Json(json!({ "ok": true })))
}
