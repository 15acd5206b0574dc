//! # vmbroker server
//!
//! HTTP surface for the vmbroker provisioning orchestrator:
//!
//! - **Client API**: idempotent session creation, session listing, deletion,
//!   log proxying, and per-session SSE event streams.
//! - **Worker callbacks**: status/checklist/result endpoints authenticated
//!   with per-worker HMAC envelopes.
//! - **Admin API**: worker registration, updates, disable, and fleet
//!   listing with live active-session counts.
//!
//! The server trusts an upstream identity layer to resolve callers; it reads
//! the caller id from the `X-User-Id` header and scopes the client API to it.

pub mod errors;
pub mod handlers;
pub mod infra;
pub mod routes;

pub use errors::{AppError, AppResult};
pub use infra::app_state::AppState;
pub use infra::config::Config;
pub use routes::create_api_router;
