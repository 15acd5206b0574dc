use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ids::{SessionId, WorkerId};

/// Lifecycle state of a provisioning session.
///
/// Terminal states are `Failed`, `Expired` and `Deleted`; the only
/// transitions out of a terminal state are `Failed`/`Expired` -> `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Provisioning,
    Ready,
    Failed,
    Expired,
    Deleted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Provisioning => "provisioning",
            SessionStatus::Ready => "ready",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
            SessionStatus::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SessionStatus::Pending),
            "provisioning" => Some(SessionStatus::Provisioning),
            "ready" => Some(SessionStatus::Ready),
            "failed" => Some(SessionStatus::Failed),
            "expired" => Some(SessionStatus::Expired),
            "deleted" => Some(SessionStatus::Deleted),
            _ => None,
        }
    }

    /// Statuses that count against a worker's concurrency ceiling.
    pub const ACTIVE: [SessionStatus; 3] = [
        SessionStatus::Pending,
        SessionStatus::Provisioning,
        SessionStatus::Ready,
    ];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Failed
                | SessionStatus::Expired
                | SessionStatus::Deleted
        )
    }
}

/// One progress marker in a session's provisioning checklist.
///
/// Items are merged by `key` and never reordered; a worker re-sending a key
/// overwrites that item in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub key: String,
    pub label: String,
    pub done: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Connection credentials for a ready VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCredentials {
    pub rdp_host: String,
    pub rdp_port: u16,
    pub rdp_user: String,
    pub rdp_password: String,
}

/// Outcome of provisioning, present once a session is `ready` or `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SessionResult {
    Ready {
        credentials: VmCredentials,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_url: Option<String>,
    },
    Failed {
        reason: String,
    },
}

/// One user-visible VM provisioning request and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: Uuid,
    pub idempotency_key: String,
    pub status: SessionStatus,
    pub provision_action: i32,
    pub worker_id: Option<WorkerId>,
    /// Opaque job identifier assigned by the worker; required to address
    /// stop and log calls. Never exposed to end clients.
    #[serde(skip_serializing, default)]
    pub worker_route: Option<String>,
    pub checklist: Vec<ChecklistItem>,
    pub result: Option<SessionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Merge checklist items by key, preserving the order in which keys were
    /// first seen.
    pub fn merge_checklist(&mut self, items: Vec<ChecklistItem>) {
        for item in items {
            match self.checklist.iter_mut().find(|c| c.key == item.key) {
                Some(existing) => *existing = item,
                None => self.checklist.push(item),
            }
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.result {
            Some(SessionResult::Failed { reason }) => Some(reason),
            _ => None,
        }
    }
}
