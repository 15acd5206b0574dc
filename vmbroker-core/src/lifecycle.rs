//! Session lifecycle management.
//!
//! The lifecycle manager is the only writer of session state. It consumes
//! selector output to create sessions and authenticated callback payloads to
//! advance them, and it publishes exactly one broadcast event per accepted
//! transition, while still holding that session's lock, so subscribers see
//! transitions in the order they were applied.

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use vmbroker_model::{
    ChecklistCallback, ResultCallback, ResultStatus, Session, SessionEvent,
    SessionId, SessionResult, SessionStatus, StatusCallback, VmCredentials,
    Worker,
};

use crate::client::WorkerClient;
use crate::error::{BrokerError, Result};
use crate::events::SessionEventBus;
use crate::registry::WorkerRegistry;
use crate::selector::WorkerSelector;
use crate::store::{NewSession, SessionStore};

/// Result of a create request: the session plus whether this call created it
/// (false means the idempotency key was already used and the existing
/// session is returned unchanged).
#[derive(Debug, Clone)]
pub struct CreateSessionOutcome {
    pub session: Session,
    pub created: bool,
}

pub struct SessionLifecycle {
    sessions: Arc<dyn SessionStore>,
    registry: Arc<WorkerRegistry>,
    selector: WorkerSelector,
    client: Arc<dyn WorkerClient>,
    bus: Arc<SessionEventBus>,
    /// Per-session mutation locks. All transitions for one session are
    /// serialized; across sessions no ordering is implied. Entries are
    /// dropped once the session reaches a terminal state.
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
    /// Serializes select-then-assign across creates: two concurrent requests
    /// must not both pass a worker's ceiling check before either assignment
    /// is recorded. Held only around the in-process selection read and the
    /// assignment write, never across worker dispatch.
    assign_lock: Mutex<()>,
    session_ttl: Duration,
}

impl fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLifecycle")
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

impl SessionLifecycle {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        registry: Arc<WorkerRegistry>,
        selector: WorkerSelector,
        client: Arc<dyn WorkerClient>,
        bus: Arc<SessionEventBus>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            registry,
            selector,
            client,
            bus,
            locks: DashMap::new(),
            assign_lock: Mutex::new(()),
            session_ttl,
        }
    }

    /// Number of sessions with a live lock entry, for diagnostics.
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    fn session_lock(&self, id: SessionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn drop_lock(&self, id: SessionId) {
        self.locks.remove(&id);
    }

    fn publish_status(&self, session: &Session) {
        self.bus.publish(SessionEvent::StatusUpdate {
            session_id: session.id,
            status: session.status,
            result: session.result.clone(),
        });
    }

    /// Create a session, or return the caller's existing one for a reused
    /// idempotency key. The storage layer makes the key check atomic with
    /// the insert, so concurrent retries converge on one session and one
    /// worker job.
    pub async fn create(
        &self,
        new: NewSession,
    ) -> Result<CreateSessionOutcome> {
        let provision_action = new.provision_action;
        let (session, created) =
            self.sessions.insert_or_get(new).await?;
        if !created {
            info!(
                session_id = %session.id,
                "idempotency key reuse, returning existing session"
            );
            return Ok(CreateSessionOutcome {
                session,
                created: false,
            });
        }

        let lock = self.session_lock(session.id);
        let _guard = lock.lock().await;
        let mut session = session;
        self.publish_status(&session);

        let assign = self.assign_lock.lock().await;
        let candidates = self.registry.candidate_ids().await?;
        let worker = match self.selector.select(&candidates).await {
            Ok(worker) => worker,
            Err(BrokerError::CapacityExhausted) => {
                drop(assign);
                self.fail_locked(
                    &mut session,
                    "no worker capacity available".to_string(),
                )
                .await?;
                drop(_guard);
                self.drop_lock(session.id);
                return Err(BrokerError::CapacityExhausted);
            }
            Err(err) => return Err(err),
        };

        // Record the assignment before releasing the assignment lock so the
        // session counts against the worker's ceiling for the next create,
        // and before dispatching so it holds during the worker call too.
        session.worker_id = Some(worker.id);
        session.updated_at = Utc::now();
        self.sessions.update_session(&session).await?;
        drop(assign);

        match self
            .client
            .create(&worker, session.id, provision_action)
            .await
        {
            Ok(job) => {
                session.status = SessionStatus::Provisioning;
                session.worker_route = Some(job.route);
                session.updated_at = Utc::now();
                self.sessions.update_session(&session).await?;
                self.publish_status(&session);
                info!(
                    session_id = %session.id,
                    worker_id = %worker.id,
                    "session provisioning"
                );
                Ok(CreateSessionOutcome {
                    session,
                    created: true,
                })
            }
            Err(BrokerError::ProvisionFailed(reason)) => {
                warn!(
                    session_id = %session.id,
                    worker_id = %worker.id,
                    %reason,
                    "worker create call failed"
                );
                self.fail_locked(&mut session, reason).await?;
                drop(_guard);
                self.drop_lock(session.id);
                Ok(CreateSessionOutcome {
                    session,
                    created: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn fail_locked(
        &self,
        session: &mut Session,
        reason: String,
    ) -> Result<()> {
        session.status = SessionStatus::Failed;
        session.result = Some(SessionResult::Failed { reason });
        session.updated_at = Utc::now();
        self.sessions.update_session(session).await?;
        self.publish_status(session);
        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> Result<Session> {
        self.sessions
            .get_session(id)
            .await?
            .ok_or(BrokerError::UnknownSession(id.to_uuid()))
    }

    pub async fn list_for_user(
        &self,
        user_id: uuid::Uuid,
    ) -> Result<Vec<Session>> {
        self.sessions.list_user_sessions(user_id).await
    }

    /// Fleet-level status callback: update the worker's heartbeat record.
    pub async fn apply_status(
        &self,
        worker: &Worker,
        callback: StatusCallback,
    ) -> Result<()> {
        self.registry
            .record_heartbeat(worker.id, callback.current_jobs)
            .await
    }

    /// Checklist callback: merge items by key into a provisioning session.
    /// Unknown and terminal sessions are accepted but have no effect beyond
    /// a log line; the worker may be stale or racing a deletion.
    pub async fn apply_checklist(
        &self,
        worker: &Worker,
        callback: ChecklistCallback,
    ) -> Result<()> {
        let session_id = callback.session_id;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let Some(mut session) = self.sessions.get_session(session_id).await?
        else {
            warn!(%session_id, worker_id = %worker.id, "checklist callback for unknown session");
            return Ok(());
        };
        if session.status != SessionStatus::Provisioning {
            info!(
                %session_id,
                status = session.status.as_str(),
                "checklist callback ignored outside provisioning"
            );
            return Ok(());
        }
        if session.worker_id != Some(worker.id) {
            warn!(
                %session_id,
                worker_id = %worker.id,
                "checklist callback from worker that does not own the session"
            );
            return Ok(());
        }

        let now = Utc::now();
        session.merge_checklist(
            callback
                .items
                .into_iter()
                .map(|item| item.into_item(now))
                .collect(),
        );
        session.updated_at = now;
        self.sessions.update_session(&session).await?;
        self.bus.publish(SessionEvent::ChecklistUpdate {
            session_id,
            items: session.checklist.clone(),
        });
        Ok(())
    }

    /// Result callback: final transition to `ready` or `failed`. The first
    /// valid transition wins; a second result for the same session is
    /// accepted but ignored, since workers may double-report.
    pub async fn apply_result(
        &self,
        worker: &Worker,
        callback: ResultCallback,
    ) -> Result<()> {
        let session_id = callback.session_id;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let Some(mut session) = self.sessions.get_session(session_id).await?
        else {
            warn!(%session_id, worker_id = %worker.id, "result callback for unknown session");
            return Ok(());
        };
        if session.status != SessionStatus::Provisioning {
            info!(
                %session_id,
                status = session.status.as_str(),
                "result callback ignored outside provisioning"
            );
            return Ok(());
        }
        if session.worker_id != Some(worker.id) {
            warn!(
                %session_id,
                worker_id = %worker.id,
                "result callback from worker that does not own the session"
            );
            return Ok(());
        }

        let now = Utc::now();
        match callback.status {
            ResultStatus::Ready => {
                match credentials_from(&callback) {
                    Some(credentials) => {
                        session.status = SessionStatus::Ready;
                        session.result = Some(SessionResult::Ready {
                            credentials,
                            log_url: callback.log_url,
                        });
                        session.expires_at = Some(now + self.session_ttl);
                        info!(%session_id, "session ready");
                    }
                    None => {
                        // A ready report without connection credentials is
                        // unusable; treat it as a failure.
                        session.status = SessionStatus::Failed;
                        session.result = Some(SessionResult::Failed {
                            reason: "worker reported ready without \
                                     connection credentials"
                                .into(),
                        });
                        warn!(%session_id, "ready result missing credentials");
                    }
                }
            }
            ResultStatus::Failed => {
                session.status = SessionStatus::Failed;
                session.result = Some(SessionResult::Failed {
                    reason: callback
                        .message
                        .unwrap_or_else(|| "worker reported failure".into()),
                });
                info!(%session_id, "session failed");
            }
        }
        session.updated_at = now;
        self.sessions.update_session(&session).await?;
        self.publish_status(&session);
        if session.status.is_terminal() {
            drop(_guard);
            self.drop_lock(session_id);
        }
        Ok(())
    }

    /// Delete a session. Allowed from `ready`, `failed` and `expired`; for
    /// a ready session the worker's stop endpoint is called best-effort and
    /// the local transition does not wait on the outcome.
    pub async fn delete(&self, id: SessionId) -> Result<()> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let mut session = self
            .sessions
            .get_session(id)
            .await?
            .ok_or(BrokerError::UnknownSession(id.to_uuid()))?;

        match session.status {
            SessionStatus::Deleted => return Ok(()),
            SessionStatus::Ready
            | SessionStatus::Failed
            | SessionStatus::Expired => {}
            SessionStatus::Pending | SessionStatus::Provisioning => {
                return Err(BrokerError::Validation(
                    "session is still provisioning".into(),
                ));
            }
        }

        if session.status == SessionStatus::Ready {
            self.request_stop(&session).await;
        }

        session.status = SessionStatus::Deleted;
        session.updated_at = Utc::now();
        self.sessions.update_session(&session).await?;
        self.publish_status(&session);
        drop(_guard);
        self.drop_lock(id);
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    async fn request_stop(&self, session: &Session) {
        let (Some(worker_id), Some(route)) =
            (session.worker_id, session.worker_route.as_deref())
        else {
            return;
        };
        let worker = match self.registry.get(worker_id).await {
            Ok(worker) => worker,
            Err(err) => {
                warn!(session_id = %session.id, %err, "stop skipped, worker lookup failed");
                return;
            }
        };
        if let Err(err) = self.client.stop(&worker, route).await {
            // Stop requested, outcome unknown. Leaving a zombie session the
            // user cannot dismiss would be worse than an orphaned VM.
            warn!(session_id = %session.id, %err, "stop call failed");
        }
    }

    /// Proxy the worker's raw provisioning log for a session. Worker
    /// addresses and routes never leave the orchestrator.
    pub async fn fetch_log(&self, id: SessionId) -> Result<String> {
        let session = self.get(id).await?;
        let (Some(worker_id), Some(route)) =
            (session.worker_id, session.worker_route.as_deref())
        else {
            return Err(BrokerError::Validation(
                "session has no provisioning log".into(),
            ));
        };
        let worker = self.registry.get(worker_id).await?;
        self.client.fetch_log(&worker, route).await
    }

    /// Reaper entry: move a ready session past its expiry to `expired`.
    pub async fn expire(&self, id: SessionId) -> Result<bool> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let Some(mut session) = self.sessions.get_session(id).await? else {
            return Ok(false);
        };
        let due = session.status == SessionStatus::Ready
            && session.expires_at.is_some_and(|at| at <= Utc::now());
        if !due {
            return Ok(false);
        }

        self.request_stop(&session).await;
        session.status = SessionStatus::Expired;
        session.updated_at = Utc::now();
        self.sessions.update_session(&session).await?;
        self.publish_status(&session);
        drop(_guard);
        self.drop_lock(id);
        info!(session_id = %id, "session expired");
        Ok(true)
    }

    /// Reaper entry: fail a session stuck in pending/provisioning past the
    /// deadline, so every non-terminal state reaches a terminal one in
    /// bounded time even if the worker never calls back.
    pub async fn fail_stale(
        &self,
        id: SessionId,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<bool> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let Some(mut session) = self.sessions.get_session(id).await? else {
            return Ok(false);
        };
        let stuck = matches!(
            session.status,
            SessionStatus::Pending | SessionStatus::Provisioning
        ) && session.updated_at <= cutoff;
        if !stuck {
            return Ok(false);
        }

        warn!(session_id = %id, "provisioning deadline exceeded");
        self.fail_locked(
            &mut session,
            "provisioning deadline exceeded".to_string(),
        )
        .await?;
        drop(_guard);
        self.drop_lock(id);
        Ok(true)
    }
}

fn credentials_from(callback: &ResultCallback) -> Option<VmCredentials> {
    Some(VmCredentials {
        rdp_host: callback.rdp_host.clone()?,
        rdp_port: callback.rdp_port?,
        rdp_user: callback.rdp_user.clone()?,
        rdp_password: callback.rdp_password.clone()?,
    })
}
