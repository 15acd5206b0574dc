use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;
use crate::session::ChecklistItem;

/// Fleet-level status report a worker sends about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCallback {
    pub current_jobs: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

/// Incremental checklist update for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistCallback {
    pub session_id: SessionId,
    pub items: Vec<ChecklistItemUpdate>,
}

/// Wire shape of a checklist item as workers report it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItemUpdate {
    pub key: String,
    pub label: String,
    pub done: bool,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ChecklistItemUpdate {
    pub fn into_item(self, fallback_ts: DateTime<Utc>) -> ChecklistItem {
        ChecklistItem {
            key: self.key,
            label: self.label,
            done: self.done,
            timestamp: self.ts.unwrap_or(fallback_ts),
            metadata: self.meta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ready,
    Failed,
}

/// Final provisioning outcome reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCallback {
    pub session_id: SessionId,
    pub status: ResultStatus,
    #[serde(default)]
    pub rdp_host: Option<String>,
    #[serde(default)]
    pub rdp_port: Option<u16>,
    #[serde(default)]
    pub rdp_user: Option<String>,
    #[serde(default)]
    pub rdp_password: Option<String>,
    #[serde(default)]
    pub log_url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
