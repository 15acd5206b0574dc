//! Least-loaded worker selection.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use vmbroker_model::{Worker, WorkerId, WorkerStatus};

use crate::error::{BrokerError, Result};
use crate::store::{SessionStore, WorkerStore};

/// Picks one eligible worker for a provisioning job, or reports exhaustion.
///
/// This is deliberately read-then-decide: two concurrent selections can both
/// observe a worker under its ceiling and momentarily overshoot it. The
/// ceiling is an operational soft limit, so the race is tolerated and
/// reconciled by the reaper rather than prevented with a global lock.
pub struct WorkerSelector {
    workers: Arc<dyn WorkerStore>,
    sessions: Arc<dyn SessionStore>,
}

impl fmt::Debug for WorkerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSelector").finish_non_exhaustive()
    }
}

impl WorkerSelector {
    pub fn new(
        workers: Arc<dyn WorkerStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self { workers, sessions }
    }

    /// Select the active candidate with the lowest active-session count that
    /// is still under its ceiling. Ties break by registry insertion order so
    /// a given fleet state always yields the same pick.
    pub async fn select(&self, candidates: &[WorkerId]) -> Result<Worker> {
        let workers = self.workers.list_workers().await?;
        let eligible: Vec<&Worker> = workers
            .iter()
            .filter(|w| {
                w.status == WorkerStatus::Active && candidates.contains(&w.id)
            })
            .collect();
        if eligible.is_empty() {
            return Err(BrokerError::CapacityExhausted);
        }

        let ids: Vec<WorkerId> = eligible.iter().map(|w| w.id).collect();
        let counts = self.sessions.active_session_counts(&ids).await?;

        let mut best: Option<(&Worker, i64)> = None;
        for worker in eligible {
            let active = counts.get(&worker.id).copied().unwrap_or(0);
            if active >= i64::from(worker.max_concurrent_sessions) {
                continue;
            }
            // Strict comparison keeps the first (oldest-registered) worker
            // on ties.
            if best.is_none_or(|(_, best_count)| active < best_count) {
                best = Some((worker, active));
            }
        }

        match best {
            Some((worker, active)) => {
                debug!(
                    worker_id = %worker.id,
                    active,
                    ceiling = worker.max_concurrent_sessions,
                    "selected worker"
                );
                Ok(worker.clone())
            }
            None => Err(BrokerError::CapacityExhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, NewSession};
    use chrono::{Duration, Utc};
    use uuid::Uuid;
    use vmbroker_model::SessionId;

    fn worker(offset_secs: i64, ceiling: i32) -> Worker {
        let created = Utc::now() + Duration::seconds(offset_secs);
        Worker {
            id: WorkerId::new(),
            label: None,
            base_address: "http://worker.internal:9000".into(),
            status: WorkerStatus::Active,
            max_concurrent_sessions: ceiling,
            credential: "secret".into(),
            reported_jobs: None,
            last_heartbeat: None,
            created_at: created,
            updated_at: created,
        }
    }

    async fn assign_session(store: &InMemoryStore, worker_id: WorkerId) {
        let (mut session, created) = store
            .insert_or_get(NewSession {
                id: SessionId::new(),
                user_id: Uuid::new_v4(),
                idempotency_key: Uuid::new_v4().to_string(),
                provision_action: 1,
            })
            .await
            .unwrap();
        assert!(created);
        session.worker_id = Some(worker_id);
        store.update_session(&session).await.unwrap();
    }

    #[tokio::test]
    async fn picks_lowest_loaded_active_worker() {
        let store = Arc::new(InMemoryStore::new());
        let w1 = worker(0, 5);
        let w2 = worker(1, 5);
        let (id1, id2) = (w1.id, w2.id);
        store.insert_worker(w1).await.unwrap();
        store.insert_worker(w2).await.unwrap();
        assign_session(&store, id1).await;
        assign_session(&store, id1).await;
        assign_session(&store, id2).await;

        let selector = WorkerSelector::new(store.clone(), store.clone());
        let picked = selector.select(&[id1, id2]).await.unwrap();
        assert_eq!(picked.id, id2);
    }

    #[tokio::test]
    async fn tie_breaks_by_insertion_order() {
        let store = Arc::new(InMemoryStore::new());
        let w1 = worker(0, 5);
        let w2 = worker(1, 5);
        let (id1, id2) = (w1.id, w2.id);
        store.insert_worker(w1).await.unwrap();
        store.insert_worker(w2).await.unwrap();

        let selector = WorkerSelector::new(store.clone(), store.clone());
        let picked = selector.select(&[id2, id1]).await.unwrap();
        assert_eq!(picked.id, id1);
    }

    #[tokio::test]
    async fn skips_workers_at_ceiling_and_disabled_workers() {
        let store = Arc::new(InMemoryStore::new());
        let full = worker(0, 1);
        let mut disabled = worker(1, 5);
        disabled.status = WorkerStatus::Disabled;
        let spare = worker(2, 1);
        let (full_id, disabled_id, spare_id) =
            (full.id, disabled.id, spare.id);
        store.insert_worker(full).await.unwrap();
        store.insert_worker(disabled).await.unwrap();
        store.insert_worker(spare).await.unwrap();
        assign_session(&store, full_id).await;

        let selector = WorkerSelector::new(store.clone(), store.clone());
        let picked = selector
            .select(&[full_id, disabled_id, spare_id])
            .await
            .unwrap();
        assert_eq!(picked.id, spare_id);
    }

    #[tokio::test]
    async fn exhausted_when_no_candidate_qualifies() {
        let store = Arc::new(InMemoryStore::new());
        let w = worker(0, 1);
        let id = w.id;
        store.insert_worker(w).await.unwrap();
        assign_session(&store, id).await;

        let selector = WorkerSelector::new(store.clone(), store.clone());
        let err = selector.select(&[id]).await.unwrap_err();
        assert!(matches!(err, BrokerError::CapacityExhausted));
    }
}
