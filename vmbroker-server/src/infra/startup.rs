use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use vmbroker_core::{
    CallbackAuthenticator, HttpWorkerClient, InMemoryStore, PostgresStore,
    Reaper, ReaperConfig, SessionEventBus, SessionLifecycle, SessionStore,
    WorkerClientConfig, WorkerRegistry, WorkerSelector, WorkerStore,
};

use crate::infra::{app_state::AppState, config::Config};

/// Wire up the application: storage, registry, lifecycle, authenticator and
/// event bus. Returns the shared state plus the background reaper, which the
/// caller is responsible for spawning.
pub async fn build_state(config: Config) -> Result<(AppState, Reaper)> {
    let (workers, sessions): (Arc<dyn WorkerStore>, Arc<dyn SessionStore>) =
        match &config.database_url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(url)
                    .await
                    .context("failed to connect to database")?;
                sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .context("failed to run database migrations")?;
                info!("connected to postgres");
                let store = Arc::new(PostgresStore::new(pool));
                (store.clone(), store)
            }
            None => {
                warn!(
                    "DATABASE_URL not set, using in-memory store; \
                     all workers and sessions are lost on restart"
                );
                let store = Arc::new(InMemoryStore::new());
                (store.clone(), store)
            }
        };

    let registry =
        Arc::new(WorkerRegistry::new(workers.clone(), sessions.clone()));
    let selector = WorkerSelector::new(workers.clone(), sessions.clone());
    let client = Arc::new(HttpWorkerClient::new(WorkerClientConfig {
        request_timeout: Duration::from_secs(config.worker_request_timeout_secs),
        connect_timeout: Duration::from_secs(config.worker_connect_timeout_secs),
    })?);
    let bus = Arc::new(SessionEventBus::new());

    let lifecycle = Arc::new(SessionLifecycle::new(
        sessions.clone(),
        registry.clone(),
        selector,
        client,
        bus.clone(),
        config.session_ttl(),
    ));

    let authenticator = Arc::new(CallbackAuthenticator::new(
        workers,
        config.callback_skew(),
    ));

    let reaper = Reaper::new(
        lifecycle.clone(),
        sessions,
        ReaperConfig {
            interval: config.reaper_interval(),
            provisioning_deadline: config.provisioning_deadline(),
        },
    );

    let state = AppState {
        config: Arc::new(config),
        registry,
        lifecycle,
        authenticator,
        bus,
    };

    Ok((state, reaper))
}
