use thiserror::Error;
use uuid::Uuid;

use crate::auth::RejectReason;

/// Error taxonomy for the orchestrator.
///
/// `CapacityExhausted` and `DuplicateCreate` are expected operational
/// conditions, not faults; callers surface them as retry-later and
/// return-existing respectively.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("no eligible worker has free capacity")]
    CapacityExhausted,

    #[error("provisioning could not be started: {0}")]
    ProvisionFailed(String),

    #[error("callback rejected: {0}")]
    CallbackRejected(RejectReason),

    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    #[error("worker not found: {0}")]
    WorkerNotFound(Uuid),

    #[error("invalid worker base address: {0}")]
    InvalidAddress(String),

    #[error("{0}")]
    Validation(String),

    #[error("worker call failed: {0}")]
    WorkerUnreachable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        BrokerError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Internal(format!("serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
