use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;

/// Administrative state of a worker node.
///
/// Disabled workers are never selected for new jobs, but sessions they
/// already own continue to be tracked until they reach a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Disabled,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Disabled => "disabled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(WorkerStatus::Active),
            "disabled" => Some(WorkerStatus::Disabled),
            _ => None,
        }
    }
}

/// A registered worker node.
///
/// The `credential` is the shared secret used to verify callback signatures
/// from this worker. It is never serialized into API responses; the only
/// place it leaves the orchestrator is the one-time registration response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub label: Option<String>,
    pub base_address: String,
    pub status: WorkerStatus,
    pub max_concurrent_sessions: i32,
    #[serde(skip_serializing, default)]
    pub credential: String,
    /// Job count the worker last reported about itself via a status callback.
    pub reported_jobs: Option<i32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Worker view returned by the registry's list operation, including the live
/// active-session count derived from the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub label: Option<String>,
    pub base_address: String,
    pub status: WorkerStatus,
    pub max_concurrent_sessions: i32,
    pub active_sessions: i64,
    pub reported_jobs: Option<i32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerSummary {
    pub fn from_worker(worker: &Worker, active_sessions: i64) -> Self {
        Self {
            id: worker.id,
            label: worker.label.clone(),
            base_address: worker.base_address.clone(),
            status: worker.status,
            max_concurrent_sessions: worker.max_concurrent_sessions,
            active_sessions,
            reported_jobs: worker.reported_jobs,
            last_heartbeat: worker.last_heartbeat,
            created_at: worker.created_at,
            updated_at: worker.updated_at,
        }
    }
}
