use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::session::{ChecklistItem, SessionResult, SessionStatus};

/// Broadcast event for one session.
///
/// Each variant carries the full current snapshot of the relevant field, not
/// a diff, so a client that misses events can re-read the session for ground
/// truth and lose nothing but latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    #[serde(rename = "status.update")]
    StatusUpdate {
        session_id: SessionId,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<SessionResult>,
    },
    #[serde(rename = "checklist.update")]
    ChecklistUpdate {
        session_id: SessionId,
        items: Vec<ChecklistItem>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::StatusUpdate { session_id, .. } => *session_id,
            SessionEvent::ChecklistUpdate { session_id, .. } => *session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StatusUpdate { .. } => "status.update",
            SessionEvent::ChecklistUpdate { .. } => "checklist.update",
        }
    }

    /// Whether this event reports a terminal status, after which the
    /// broadcaster closes the session's channel.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::StatusUpdate { status, .. } if status.is_terminal()
        )
    }
}
