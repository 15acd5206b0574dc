//! Storage ports for the orchestrator.
//!
//! The registry and session tables are logically independent collections
//! behind two traits so the lifecycle manager, selector and registry never
//! touch a concrete database. `PostgresStore` is the durable implementation;
//! `InMemoryStore` backs tests and single-node development runs.

mod memory;
mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use vmbroker_model::{Session, SessionId, Worker, WorkerId};

use crate::error::Result;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Fields needed to create a pending session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: SessionId,
    pub user_id: Uuid,
    pub idempotency_key: String,
    pub provision_action: i32,
}

#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn insert_worker(&self, worker: Worker) -> Result<()>;

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>>;

    async fn update_worker(&self, worker: &Worker) -> Result<()>;

    /// All workers in registry insertion order (created_at, then id). The
    /// selector relies on this order for its deterministic tiebreak.
    async fn list_workers(&self) -> Result<Vec<Worker>>;

    async fn record_heartbeat(
        &self,
        id: WorkerId,
        reported_jobs: i32,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a pending session unless `(user_id, idempotency_key)` already
    /// exists; returns the stored session and whether this call created it.
    ///
    /// Implementations must make the uniqueness check atomic with the insert
    /// (a database unique constraint, or a single write lock) so concurrent
    /// retries of the same create request never produce two sessions.
    async fn insert_or_get(&self, new: NewSession) -> Result<(Session, bool)>;

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>>;

    async fn update_session(&self, session: &Session) -> Result<()>;

    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>>;

    /// Count of sessions in an active status (pending/provisioning/ready)
    /// per worker, for the given workers.
    async fn active_session_counts(
        &self,
        worker_ids: &[WorkerId],
    ) -> Result<HashMap<WorkerId, i64>>;

    /// Ready sessions whose `expires_at` is at or before `cutoff`.
    async fn expired_ready_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    /// Pending/provisioning sessions last updated at or before `cutoff`.
    async fn stale_inflight_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>>;
}
