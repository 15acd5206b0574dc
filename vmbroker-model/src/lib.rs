//! Core data model definitions shared across vmbroker crates.
#![allow(missing_docs)]

pub mod callback;
pub mod event;
pub mod ids;
pub mod session;
pub mod worker;

pub use callback::{
    ChecklistCallback, ChecklistItemUpdate, ResultCallback, ResultStatus,
    StatusCallback,
};
pub use event::SessionEvent;
pub use ids::{SessionId, WorkerId};
pub use session::{
    ChecklistItem, Session, SessionResult, SessionStatus, VmCredentials,
};
pub use worker::{Worker, WorkerStatus, WorkerSummary};
