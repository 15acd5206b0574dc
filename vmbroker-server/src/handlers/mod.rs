pub mod callbacks;
pub mod events;
pub mod sessions;
pub mod workers;

use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::errors::AppError;
use crate::infra::app_state::AppState;

/// Caller identity resolved by the upstream auth layer and forwarded as the
/// `X-User-Id` header. The broker scopes every session endpoint to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub Uuid);

impl FromRequestParts<AppState> for CallerId {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .map(CallerId)
            .ok_or_else(|| {
                AppError::unauthorized("missing or invalid X-User-Id header")
            })
    }
}
