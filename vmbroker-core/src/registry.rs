//! Worker registry: the durable record of known workers and their
//! concurrency ceilings.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use tracing::{info, warn};
use url::Url;

use vmbroker_model::{Worker, WorkerId, WorkerStatus, WorkerSummary};

use crate::error::{BrokerError, Result};
use crate::store::{SessionStore, WorkerStore};

/// Fields supplied when an administrator registers a worker.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub label: Option<String>,
    pub base_address: String,
    pub max_concurrent_sessions: i32,
}

/// Partial update applied to an existing worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerUpdate {
    pub label: Option<String>,
    pub base_address: Option<String>,
    pub max_concurrent_sessions: Option<i32>,
    pub status: Option<WorkerStatus>,
}

pub struct WorkerRegistry {
    workers: Arc<dyn WorkerStore>,
    sessions: Arc<dyn SessionStore>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry").finish_non_exhaustive()
    }
}

/// Normalize and validate a worker base address. Accepts http/https URLs
/// with a host; the stored form has no trailing slash so endpoint
/// composition stays uniform.
fn normalize_address(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|_| BrokerError::InvalidAddress(trimmed.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(BrokerError::InvalidAddress(trimmed.to_string()));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

fn generate_credential() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl WorkerRegistry {
    pub fn new(
        workers: Arc<dyn WorkerStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self { workers, sessions }
    }

    /// Register a new worker. The generated credential is part of the
    /// returned record; the caller must surface it exactly once and never
    /// again.
    pub async fn register(
        &self,
        registration: WorkerRegistration,
    ) -> Result<Worker> {
        if registration.max_concurrent_sessions <= 0 {
            return Err(BrokerError::Validation(
                "max_concurrent_sessions must be positive".into(),
            ));
        }
        let base_address = normalize_address(&registration.base_address)?;
        let now = Utc::now();
        let worker = Worker {
            id: WorkerId::new(),
            label: registration.label,
            base_address,
            status: WorkerStatus::Active,
            max_concurrent_sessions: registration.max_concurrent_sessions,
            credential: generate_credential(),
            reported_jobs: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        };
        self.workers.insert_worker(worker.clone()).await?;
        info!(worker_id = %worker.id, base = %worker.base_address, "registered worker");
        Ok(worker)
    }

    pub async fn get(&self, id: WorkerId) -> Result<Worker> {
        self.workers
            .get_worker(id)
            .await?
            .ok_or(BrokerError::WorkerNotFound(id.to_uuid()))
    }

    pub async fn update(
        &self,
        id: WorkerId,
        update: WorkerUpdate,
    ) -> Result<Worker> {
        let mut worker = self.get(id).await?;

        if let Some(label) = update.label {
            worker.label = Some(label);
        }
        if let Some(base_address) = update.base_address {
            worker.base_address = normalize_address(&base_address)?;
        }
        if let Some(status) = update.status {
            worker.status = status;
        }
        if let Some(ceiling) = update.max_concurrent_sessions {
            if ceiling <= 0 {
                return Err(BrokerError::Validation(
                    "max_concurrent_sessions must be positive".into(),
                ));
            }
            let counts =
                self.sessions.active_session_counts(&[worker.id]).await?;
            let active = counts.get(&worker.id).copied().unwrap_or(0);
            // Draining below the current load is allowed; the selector stops
            // assigning until the count falls under the new ceiling.
            if i64::from(ceiling) < active {
                warn!(
                    worker_id = %worker.id,
                    ceiling,
                    active,
                    "new ceiling is below current active sessions"
                );
            }
            worker.max_concurrent_sessions = ceiling;
        }

        worker.updated_at = Utc::now();
        self.workers.update_worker(&worker).await?;
        Ok(worker)
    }

    /// Disabled workers are never selected; their existing sessions continue
    /// to be tracked.
    pub async fn disable(&self, id: WorkerId) -> Result<Worker> {
        self.update(
            id,
            WorkerUpdate {
                status: Some(WorkerStatus::Disabled),
                ..WorkerUpdate::default()
            },
        )
        .await
    }

    pub async fn list(&self) -> Result<Vec<WorkerSummary>> {
        let workers = self.workers.list_workers().await?;
        let ids: Vec<WorkerId> = workers.iter().map(|w| w.id).collect();
        let counts = self.sessions.active_session_counts(&ids).await?;
        Ok(workers
            .iter()
            .map(|w| {
                WorkerSummary::from_worker(
                    w,
                    counts.get(&w.id).copied().unwrap_or(0),
                )
            })
            .collect())
    }

    /// All currently registered worker ids, used as the default candidate
    /// set for selection.
    pub async fn candidate_ids(&self) -> Result<Vec<WorkerId>> {
        Ok(self
            .workers
            .list_workers()
            .await?
            .iter()
            .map(|w| w.id)
            .collect())
    }

    pub async fn record_heartbeat(
        &self,
        id: WorkerId,
        reported_jobs: i32,
    ) -> Result<()> {
        self.workers
            .record_heartbeat(id, reported_jobs, Utc::now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn registry(store: Arc<InMemoryStore>) -> WorkerRegistry {
        WorkerRegistry::new(store.clone(), store)
    }

    #[tokio::test]
    async fn register_normalizes_address_and_issues_credential() {
        let registry = registry(Arc::new(InMemoryStore::new()));
        let worker = registry
            .register(WorkerRegistration {
                label: Some("eu-1".into()),
                base_address: "https://worker-1.fleet.internal:9443/".into(),
                max_concurrent_sessions: 4,
            })
            .await
            .unwrap();
        assert_eq!(
            worker.base_address,
            "https://worker-1.fleet.internal:9443"
        );
        assert_eq!(worker.credential.len(), 64);
        assert_eq!(worker.status, WorkerStatus::Active);
    }

    #[tokio::test]
    async fn register_rejects_malformed_address() {
        let registry = registry(Arc::new(InMemoryStore::new()));
        let err = registry
            .register(WorkerRegistration {
                label: None,
                base_address: "not a url".into(),
                max_concurrent_sessions: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidAddress(_)));

        let err = registry
            .register(WorkerRegistration {
                label: None,
                base_address: "ftp://worker".into(),
                max_concurrent_sessions: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn update_unknown_worker_is_not_found() {
        let registry = registry(Arc::new(InMemoryStore::new()));
        let err = registry
            .update(WorkerId::new(), WorkerUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::WorkerNotFound(_)));
    }

    #[tokio::test]
    async fn disable_keeps_worker_listed() {
        let store = Arc::new(InMemoryStore::new());
        let registry = registry(store);
        let worker = registry
            .register(WorkerRegistration {
                label: None,
                base_address: "http://w".into(),
                max_concurrent_sessions: 2,
            })
            .await
            .unwrap();

        registry.disable(worker.id).await.unwrap();
        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, WorkerStatus::Disabled);
        assert_eq!(listed[0].active_sessions, 0);
    }
}
