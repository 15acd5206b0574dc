//! # vmbroker server
//!
//! Provisioning orchestrator for single-use VM sessions.
//!
//! The server sits between clients that need a VM session and a fleet of
//! provisioning workers:
//!
//! - Clients create sessions (idempotently), watch progress over SSE, read
//!   connection credentials once the VM is ready, and delete sessions.
//! - Workers receive create/stop calls and report back through HMAC-signed
//!   status, checklist and result callbacks.
//! - Administrators manage the worker fleet and its concurrency ceilings.
//!
//! PostgreSQL backs durable state; without `DATABASE_URL` the broker falls
//! back to a non-durable in-memory store for development.

use std::net::SocketAddr;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmbroker_server::{
    infra::{config::Config, startup::build_state},
    routes,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    let cors_layer = build_cors_layer(&config.cors_allowed_origins);

    let (state, reaper) = build_state(config).await?;
    reaper.spawn();

    let app = routes::create_api_router(state)
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "skipping invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(AllowHeaders::any())
}
