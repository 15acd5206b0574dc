//! HTTP-level tests over the full router with the in-memory store and a
//! scripted worker client.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use vmbroker_core::{
    CallbackAuthenticator, CreatedJob, InMemoryStore, SessionEventBus,
    SessionLifecycle, WorkerClient, WorkerRegistry, WorkerSelector, signing,
};
use vmbroker_model::{SessionId, Worker};
use vmbroker_server::{AppState, Config, create_api_router};

#[derive(Debug, Default)]
struct ScriptedWorkerClient;

#[async_trait]
impl WorkerClient for ScriptedWorkerClient {
    async fn create(
        &self,
        _worker: &Worker,
        session_id: SessionId,
        _provision_action: i32,
    ) -> vmbroker_core::Result<CreatedJob> {
        Ok(CreatedJob {
            route: format!("job-{session_id}"),
        })
    }

    async fn stop(
        &self,
        _worker: &Worker,
        _route: &str,
    ) -> vmbroker_core::Result<()> {
        Ok(())
    }

    async fn fetch_log(
        &self,
        _worker: &Worker,
        _route: &str,
    ) -> vmbroker_core::Result<String> {
        Ok("provision log".into())
    }
}

fn test_config() -> Config {
    Config {
        server_host: "127.0.0.1".into(),
        server_port: 0,
        database_url: None,
        cors_allowed_origins: Vec::new(),
        callback_skew_secs: 60,
        session_ttl_secs: 3600,
        reaper_interval_secs: 30,
        provisioning_deadline_secs: 900,
        worker_request_timeout_secs: 10,
        worker_connect_timeout_secs: 5,
    }
}

fn app() -> Router {
    let store = Arc::new(InMemoryStore::new());
    let config = test_config();
    let registry =
        Arc::new(WorkerRegistry::new(store.clone(), store.clone()));
    let selector = WorkerSelector::new(store.clone(), store.clone());
    let bus = Arc::new(SessionEventBus::new());
    let lifecycle = Arc::new(SessionLifecycle::new(
        store.clone(),
        registry.clone(),
        selector,
        Arc::new(ScriptedWorkerClient),
        bus.clone(),
        config.session_ttl(),
    ));
    let authenticator = Arc::new(CallbackAuthenticator::new(
        store,
        config.callback_skew(),
    ));

    create_api_router(AppState {
        config: Arc::new(config),
        registry,
        lifecycle,
        authenticator,
        bus,
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn json_request(
    method: &str,
    uri: &str,
    user: Option<Uuid>,
    body: Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_request(uri: &str, user: Option<Uuid>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    builder.body(Body::empty()).unwrap()
}

fn signed_callback(
    uri: &str,
    worker_id: &str,
    credential: &str,
    timestamp: &str,
    payload: &Value,
) -> Request<Body> {
    let body = payload.to_string();
    let signature =
        signing::compute_signature(credential, body.as_bytes(), timestamp);
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-worker-id", worker_id)
        .header("x-timestamp", timestamp)
        .header("x-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

/// Register a worker and return `(worker_id, credential)`.
async fn register_worker(app: &Router, ceiling: i32) -> (String, String) {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/api/v1/admin/workers",
            None,
            json!({
                "label": "w1",
                "base_address": "http://worker-1.fleet.internal:9000",
                "max_concurrent_sessions": ceiling,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (
        body["worker"]["id"].as_str().unwrap().to_string(),
        body["credential"].as_str().unwrap().to_string(),
    )
}

async fn create_session(
    app: &Router,
    user: Uuid,
    key: &str,
) -> (StatusCode, Value) {
    send(
        app,
        json_request(
            "POST",
            "/api/v1/sessions",
            Some(user),
            json!({ "idempotency_key": key, "provision_action": 1 }),
        ),
    )
    .await
}

#[tokio::test]
async fn health_endpoint_responds() {
    let app = app();
    let (status, body) = send(&app, get_request("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn create_session_provisions_on_registered_worker() {
    let app = app();
    register_worker(&app, 2).await;

    let user = Uuid::new_v4();
    let (status, session) = create_session(&app, user, "key-1").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["status"], "provisioning");
    assert_eq!(session["user_id"], user.to_string());
    // The worker-side job route never appears in API responses.
    assert!(session.get("worker_route").is_none());
}

#[tokio::test]
async fn replayed_idempotency_key_returns_existing_session() {
    let app = app();
    register_worker(&app, 2).await;

    let user = Uuid::new_v4();
    let (status, first) = create_session(&app, user, "key-1").await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = create_session(&app, user, "key-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["id"], second["id"]);

    // A different caller with the same key gets their own session.
    let (status, third) =
        create_session(&app, Uuid::new_v4(), "key-1").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(first["id"], third["id"]);
}

#[tokio::test]
async fn create_without_capacity_is_unavailable() {
    let app = app();
    register_worker(&app, 1).await;

    let user = Uuid::new_v4();
    let (status, _) = create_session(&app, user, "key-1").await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = create_session(&app, user, "key-2").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn session_endpoints_require_caller_identity() {
    let app = app();
    let (status, _) = send(&app, get_request("/api/v1/sessions", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn foreign_sessions_read_as_not_found() {
    let app = app();
    register_worker(&app, 2).await;

    let owner = Uuid::new_v4();
    let (_, session) = create_session(&app, owner, "key-1").await;
    let id = session["id"].as_str().unwrap();

    let (status, _) = send(
        &app,
        get_request(
            &format!("/api/v1/sessions/{id}"),
            Some(Uuid::new_v4()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, fetched) = send(
        &app,
        get_request(&format!("/api/v1/sessions/{id}"), Some(owner)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"].as_str().unwrap(), id);
}

#[tokio::test]
async fn signed_result_callback_readies_the_session() {
    let app = app();
    let (worker_id, credential) = register_worker(&app, 2).await;

    let user = Uuid::new_v4();
    let (_, session) = create_session(&app, user, "key-1").await;
    let id = session["id"].as_str().unwrap().to_string();

    let payload = json!({
        "session_id": id,
        "status": "ready",
        "rdp_host": "vm-42.fleet.internal",
        "rdp_port": 3389,
        "rdp_user": "operator",
        "rdp_password": "s3cret",
        "log_url": "https://logs.fleet.internal/job-42",
    });
    let ts = Utc::now().timestamp().to_string();
    let (status, body) = send(
        &app,
        signed_callback(
            "/api/v1/callbacks/result",
            &worker_id,
            &credential,
            &ts,
            &payload,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (_, fetched) = send(
        &app,
        get_request(&format!("/api/v1/sessions/{id}"), Some(user)),
    )
    .await;
    assert_eq!(fetched["status"], "ready");
    assert_eq!(fetched["result"]["outcome"], "ready");
    assert_eq!(
        fetched["result"]["credentials"]["rdp_host"],
        "vm-42.fleet.internal"
    );
    assert!(fetched["expires_at"].is_string());
}

#[tokio::test]
async fn stale_timestamp_callback_is_rejected() {
    let app = app();
    let (worker_id, credential) = register_worker(&app, 2).await;

    let user = Uuid::new_v4();
    let (_, session) = create_session(&app, user, "key-1").await;
    let id = session["id"].as_str().unwrap().to_string();

    let payload = json!({ "session_id": id, "status": "failed" });
    let stale = (Utc::now().timestamp() - 120).to_string();
    let (status, _) = send(
        &app,
        signed_callback(
            "/api/v1/callbacks/result",
            &worker_id,
            &credential,
            &stale,
            &payload,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The session is untouched.
    let (_, fetched) = send(
        &app,
        get_request(&format!("/api/v1/sessions/{id}"), Some(user)),
    )
    .await;
    assert_eq!(fetched["status"], "provisioning");

    let (_, metrics) = send(
        &app,
        get_request("/api/v1/admin/metrics/callback-rejections", None),
    )
    .await;
    assert_eq!(metrics["stale_timestamp"], 1);
}

#[tokio::test]
async fn signed_status_callback_updates_the_worker_record() {
    let app = app();
    let (worker_id, credential) = register_worker(&app, 2).await;

    let payload = json!({ "current_jobs": 3, "metrics": { "cpu": 0.4 } });
    let ts = Utc::now().timestamp().to_string();
    let (status, body) = send(
        &app,
        signed_callback(
            "/api/v1/callbacks/status",
            &worker_id,
            &credential,
            &ts,
            &payload,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    // The heartbeat shows up on the fleet listing.
    let (_, workers) =
        send(&app, get_request("/api/v1/admin/workers", None)).await;
    let worker = &workers.as_array().unwrap()[0];
    assert_eq!(worker["id"], worker_id.as_str());
    assert_eq!(worker["reported_jobs"], 3);
    assert!(worker["last_heartbeat"].is_string());
}

#[tokio::test]
async fn tampered_body_fails_verification() {
    let app = app();
    let (worker_id, credential) = register_worker(&app, 2).await;

    let payload = json!({ "current_jobs": 1 });
    let ts = Utc::now().timestamp().to_string();
    let mut request = signed_callback(
        "/api/v1/callbacks/status",
        &worker_id,
        &credential,
        &ts,
        &payload,
    );
    *request.body_mut() = Body::from(json!({ "current_jobs": 9 }).to_string());

    let (status, _) = send_raw(&app, request).await.0;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn checklist_callback_appears_on_the_session() {
    let app = app();
    let (worker_id, credential) = register_worker(&app, 2).await;

    let user = Uuid::new_v4();
    let (_, session) = create_session(&app, user, "key-1").await;
    let id = session["id"].as_str().unwrap().to_string();

    let payload = json!({
        "session_id": id,
        "items": [
            { "key": "image", "label": "Image pulled", "done": true },
            { "key": "boot", "label": "VM booting", "done": false },
        ],
    });
    let ts = Utc::now().timestamp().to_string();
    let (status, _) = send(
        &app,
        signed_callback(
            "/api/v1/callbacks/checklist",
            &worker_id,
            &credential,
            &ts,
            &payload,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, fetched) = send(
        &app,
        get_request(&format!("/api/v1/sessions/{id}"), Some(user)),
    )
    .await;
    let checklist = fetched["checklist"].as_array().unwrap();
    assert_eq!(checklist.len(), 2);
    assert_eq!(checklist[0]["key"], "image");
    assert_eq!(checklist[1]["done"], false);
}

#[tokio::test]
async fn delete_is_refused_while_provisioning() {
    let app = app();
    let (worker_id, credential) = register_worker(&app, 2).await;

    let user = Uuid::new_v4();
    let (_, session) = create_session(&app, user, "key-1").await;
    let id = session["id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/v1/sessions/{id}"))
        .header("x-user-id", user.to_string())
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Fail it, then deletion goes through.
    let payload =
        json!({ "session_id": id, "status": "failed", "message": "boom" });
    let ts = Utc::now().timestamp().to_string();
    send(
        &app,
        signed_callback(
            "/api/v1/callbacks/result",
            &worker_id,
            &credential,
            &ts,
            &payload,
        ),
    )
    .await;

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/v1/sessions/{id}"))
        .header("x-user-id", user.to_string())
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn session_log_is_proxied_as_text() {
    let app = app();
    register_worker(&app, 2).await;

    let user = Uuid::new_v4();
    let (_, session) = create_session(&app, user, "key-1").await;
    let id = session["id"].as_str().unwrap();

    let ((status, _), bytes) = send_raw(
        &app,
        get_request(&format!("/api/v1/sessions/{id}/log"), Some(user)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"provision log".as_slice());
}

#[tokio::test]
async fn worker_listing_never_exposes_credentials() {
    let app = app();
    register_worker(&app, 2).await;

    let (status, body) =
        send(&app, get_request("/api/v1/admin/workers", None)).await;
    assert_eq!(status, StatusCode::OK);
    let workers = body.as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert!(workers[0].get("credential").is_none());
    assert_eq!(workers[0]["active_sessions"], 0);
}

#[tokio::test]
async fn event_stream_replays_snapshot_for_terminal_session() {
    let app = app();
    let (worker_id, credential) = register_worker(&app, 2).await;

    let user = Uuid::new_v4();
    let (_, session) = create_session(&app, user, "key-1").await;
    let id = session["id"].as_str().unwrap().to_string();

    let payload =
        json!({ "session_id": id, "status": "failed", "message": "boom" });
    let ts = Utc::now().timestamp().to_string();
    send(
        &app,
        signed_callback(
            "/api/v1/callbacks/result",
            &worker_id,
            &credential,
            &ts,
            &payload,
        ),
    )
    .await;

    // Terminal session: the stream carries the snapshot and then closes, so
    // the whole body can be collected.
    let ((status, _), bytes) = send_raw(
        &app,
        get_request(&format!("/api/v1/sessions/{id}/events"), Some(user)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("event: status.update"));
    assert!(text.contains("\"failed\""));
}

async fn send_raw(
    app: &Router,
    request: Request<Body>,
) -> ((StatusCode, Value), Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    ((status, body), bytes)
}
