use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use vmbroker_model::{
    Session, SessionId, SessionStatus, Worker, WorkerId,
};

use crate::error::{BrokerError, Result};
use crate::store::{NewSession, SessionStore, WorkerStore};

#[derive(Debug, Default)]
struct Inner {
    workers: Vec<Worker>,
    sessions: HashMap<SessionId, Session>,
    idempotency: HashMap<(Uuid, String), SessionId>,
}

/// In-memory store used by tests and single-node development runs.
///
/// One `RwLock` over both collections keeps `insert_or_get` atomic, which is
/// all the idempotency invariant needs in-process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerStore for InMemoryStore {
    async fn insert_worker(&self, worker: Worker) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.workers.push(worker);
        Ok(())
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>> {
        let inner = self.inner.read().await;
        Ok(inner.workers.iter().find(|w| w.id == id).cloned())
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.workers.iter_mut().find(|w| w.id == worker.id) {
            Some(existing) => {
                *existing = worker.clone();
                Ok(())
            }
            None => Err(BrokerError::WorkerNotFound(worker.id.to_uuid())),
        }
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let inner = self.inner.read().await;
        let mut workers = inner.workers.clone();
        workers.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
        });
        Ok(workers)
    }

    async fn record_heartbeat(
        &self,
        id: WorkerId,
        reported_jobs: i32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.workers.iter_mut().find(|w| w.id == id) {
            Some(worker) => {
                worker.reported_jobs = Some(reported_jobs);
                worker.last_heartbeat = Some(at);
                worker.updated_at = at;
                Ok(())
            }
            None => Err(BrokerError::WorkerNotFound(id.to_uuid())),
        }
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn insert_or_get(&self, new: NewSession) -> Result<(Session, bool)> {
        let mut inner = self.inner.write().await;
        let key = (new.user_id, new.idempotency_key.clone());
        if let Some(existing_id) = inner.idempotency.get(&key) {
            let session = inner
                .sessions
                .get(existing_id)
                .cloned()
                .ok_or_else(|| {
                    BrokerError::Internal(
                        "idempotency index points at missing session".into(),
                    )
                })?;
            return Ok((session, false));
        }

        let now = Utc::now();
        let session = Session {
            id: new.id,
            user_id: new.user_id,
            idempotency_key: new.idempotency_key,
            status: SessionStatus::Pending,
            provision_action: new.provision_action,
            worker_id: None,
            worker_route: None,
            checklist: Vec::new(),
            result: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
        };
        inner.idempotency.insert(key, session.id);
        inner.sessions.insert(session.id, session.clone());
        Ok((session, true))
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(&id).cloned())
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(BrokerError::UnknownSession(session.id.to_uuid())),
        }
    }

    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn active_session_counts(
        &self,
        worker_ids: &[WorkerId],
    ) -> Result<HashMap<WorkerId, i64>> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for session in inner.sessions.values() {
            let Some(worker_id) = session.worker_id else {
                continue;
            };
            if session.status.is_active() && worker_ids.contains(&worker_id) {
                *counts.entry(worker_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn expired_ready_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| {
                s.status == SessionStatus::Ready
                    && s.expires_at.is_some_and(|at| at <= cutoff)
            })
            .cloned()
            .collect())
    }

    async fn stale_inflight_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    SessionStatus::Pending | SessionStatus::Provisioning
                ) && s.updated_at <= cutoff
            })
            .cloned()
            .collect())
    }
}
