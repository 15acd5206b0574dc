//! Inbound callback authentication.
//!
//! Every worker callback carries an envelope of `X-Worker-Id`,
//! `X-Timestamp` and `X-Signature` headers. Verification order: the worker
//! id must resolve to a known worker, the timestamp must fall within the
//! configured skew window, and the signature must match HMAC-SHA-256 over
//! `body ‖ timestamp` keyed by that worker's credential. Rejected envelopes
//! never reach the lifecycle manager; they are logged and counted.
//!
//! The protocol is stateless: replay value is bounded by the timestamp
//! window, not eliminated by a nonce store. Terminal-state monotonicity in
//! the lifecycle manager absorbs a replayed result, and checklist merges are
//! idempotent by key.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Duration, Utc};
use tracing::warn;

use vmbroker_model::{Worker, WorkerId};

use crate::error::{BrokerError, Result};
use crate::signing;
use crate::store::WorkerStore;

/// Why an envelope was rejected. Reasons are for logs and counters only;
/// the HTTP surface answers every rejection identically so callers learn
/// nothing about which check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownWorker,
    StaleTimestamp,
    BadSignature,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::UnknownWorker => "unknown_worker",
            RejectReason::StaleTimestamp => "stale_timestamp",
            RejectReason::BadSignature => "bad_signature",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic rejection counters for anomaly monitoring.
#[derive(Debug, Default)]
pub struct RejectionCounters {
    unknown_worker: AtomicU64,
    stale_timestamp: AtomicU64,
    bad_signature: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RejectionSnapshot {
    pub unknown_worker: u64,
    pub stale_timestamp: u64,
    pub bad_signature: u64,
}

impl RejectionCounters {
    fn record(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::UnknownWorker => &self.unknown_worker,
            RejectReason::StaleTimestamp => &self.stale_timestamp,
            RejectReason::BadSignature => &self.bad_signature,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RejectionSnapshot {
        RejectionSnapshot {
            unknown_worker: self.unknown_worker.load(Ordering::Relaxed),
            stale_timestamp: self.stale_timestamp.load(Ordering::Relaxed),
            bad_signature: self.bad_signature.load(Ordering::Relaxed),
        }
    }
}

/// Verifies that inbound callbacks genuinely originate from the worker they
/// claim to.
pub struct CallbackAuthenticator {
    workers: Arc<dyn WorkerStore>,
    skew: Duration,
    counters: RejectionCounters,
}

impl fmt::Debug for CallbackAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackAuthenticator")
            .field("skew", &self.skew)
            .finish_non_exhaustive()
    }
}

impl CallbackAuthenticator {
    pub fn new(workers: Arc<dyn WorkerStore>, skew: Duration) -> Self {
        Self {
            workers,
            skew,
            counters: RejectionCounters::default(),
        }
    }

    pub fn rejections(&self) -> RejectionSnapshot {
        self.counters.snapshot()
    }

    fn reject(
        &self,
        worker_id: WorkerId,
        reason: RejectReason,
    ) -> BrokerError {
        self.counters.record(reason);
        warn!(%worker_id, %reason, "rejected worker callback");
        BrokerError::CallbackRejected(reason)
    }

    /// Verify an envelope and return the sending worker.
    ///
    /// The timestamp header is epoch seconds; a value that does not parse is
    /// indistinguishable from one outside the window.
    pub async fn verify(
        &self,
        worker_id: WorkerId,
        timestamp: &str,
        signature: &str,
        body: &[u8],
    ) -> Result<Worker> {
        let worker = match self.workers.get_worker(worker_id).await? {
            Some(worker) => worker,
            None => {
                return Err(
                    self.reject(worker_id, RejectReason::UnknownWorker)
                );
            }
        };

        let Ok(claimed) = timestamp.trim().parse::<f64>() else {
            return Err(self.reject(worker_id, RejectReason::StaleTimestamp));
        };
        // `parse::<f64>` accepts "NaN" and "inf", and a NaN distance fails
        // the `>` comparison, so non-finite values must be ruled out before
        // the window check.
        let now = Utc::now().timestamp() as f64;
        if !claimed.is_finite()
            || (now - claimed).abs() > self.skew.num_seconds() as f64
        {
            return Err(self.reject(worker_id, RejectReason::StaleTimestamp));
        }

        if !signing::verify_signature(
            &worker.credential,
            body,
            timestamp,
            signature,
        ) {
            return Err(self.reject(worker_id, RejectReason::BadSignature));
        }

        Ok(worker)
    }
}
