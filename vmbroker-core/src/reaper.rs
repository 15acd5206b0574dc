//! Background reaping of sessions.
//!
//! Two sweeps run on one interval: ready sessions past `expires_at` move to
//! `expired`, and sessions stuck in pending/provisioning past the deadline
//! are failed. Together they guarantee every non-terminal state reaches a
//! terminal one in bounded time, whether or not the worker ever calls back.

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;
use crate::lifecycle::SessionLifecycle;
use crate::store::SessionStore;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: StdDuration,
    pub provisioning_deadline: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(30),
            provisioning_deadline: Duration::minutes(15),
        }
    }
}

pub struct Reaper {
    lifecycle: Arc<SessionLifecycle>,
    sessions: Arc<dyn SessionStore>,
    config: ReaperConfig,
}

impl fmt::Debug for Reaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reaper {
    pub fn new(
        lifecycle: Arc<SessionLifecycle>,
        sessions: Arc<dyn SessionStore>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            lifecycle,
            sessions,
            config,
        }
    }

    /// One sweep. Returns (expired, failed) counts.
    pub async fn run_once(&self) -> Result<(usize, usize)> {
        let now = Utc::now();

        let mut expired = 0;
        for session in self.sessions.expired_ready_sessions(now).await? {
            if self.lifecycle.expire(session.id).await? {
                expired += 1;
            }
        }

        let cutoff = now - self.config.provisioning_deadline;
        let mut failed = 0;
        for session in self.sessions.stale_inflight_sessions(cutoff).await? {
            if self.lifecycle.fail_stale(session.id, cutoff).await? {
                failed += 1;
            }
        }

        if expired > 0 || failed > 0 {
            info!(expired, failed, "reaper sweep finished");
        }
        Ok((expired, failed))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_once().await {
                    error!(%err, "reaper sweep failed");
                }
            }
        })
    }
}
