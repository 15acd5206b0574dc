//! Orchestrator core for the vmbroker provisioning platform.
//!
//! This crate owns everything between an authorized create-session request
//! and the session's terminal state: the worker registry and capacity
//! accounting, least-loaded worker selection, the outbound worker client,
//! signed-callback verification, the session state machine, and the
//! per-session event fan-out consumed by the server's SSE endpoints.

pub mod auth;
pub mod client;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod reaper;
pub mod registry;
pub mod selector;
pub mod signing;
pub mod store;

pub use auth::{CallbackAuthenticator, RejectReason, RejectionSnapshot};
pub use client::{
    CreatedJob, HttpWorkerClient, WorkerClient, WorkerClientConfig,
    WorkerEndpoints,
};
pub use error::{BrokerError, Result};
pub use events::SessionEventBus;
pub use lifecycle::{CreateSessionOutcome, SessionLifecycle};
pub use reaper::{Reaper, ReaperConfig};
pub use registry::{WorkerRegistration, WorkerRegistry, WorkerUpdate};
pub use selector::WorkerSelector;
pub use store::{
    InMemoryStore, NewSession, PostgresStore, SessionStore, WorkerStore,
};
