use std::{fmt, sync::Arc};

use vmbroker_core::{
    CallbackAuthenticator, SessionEventBus, SessionLifecycle, WorkerRegistry,
};

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<WorkerRegistry>,
    pub lifecycle: Arc<SessionLifecycle>,
    pub authenticator: Arc<CallbackAuthenticator>,
    pub bus: Arc<SessionEventBus>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
