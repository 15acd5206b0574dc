//! Outbound worker client.
//!
//! This is the only component allowed to issue HTTP to a worker. It wraps
//! the three-verb worker contract (create, stop, fetch-log) with bounded
//! timeouts and a single retry on transport-level failure. Application-level
//! non-2xx responses are never retried. Worker addresses and routes stop at
//! this boundary; nothing past the orchestrator ever sees them.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vmbroker_model::{SessionId, Worker};

use crate::error::{BrokerError, Result};

/// Pure composition of a worker's base address into its three endpoints.
#[derive(Debug, Clone)]
pub struct WorkerEndpoints {
    base: String,
}

impl WorkerEndpoints {
    pub fn new(base_address: &str) -> Self {
        Self {
            base: base_address.trim_end_matches('/').to_string(),
        }
    }

    pub fn create_url(&self) -> String {
        format!("{}/job/create", self.base)
    }

    pub fn stop_url(&self, route: &str) -> String {
        format!("{}/job/stop/{route}", self.base)
    }

    pub fn log_url(&self, route: &str) -> String {
        format!("{}/job/log/{route}", self.base)
    }
}

/// Worker's acknowledgement of a create call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedJob {
    /// Opaque job identifier on the worker's side; required for later stop
    /// and log calls.
    pub route: String,
}

#[derive(Debug, Serialize)]
struct CreateJobRequest {
    session_id: SessionId,
    provision_action: i32,
}

#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Ask a worker to start provisioning. Non-2xx or a malformed response
    /// body yields `ProvisionFailed`; nothing throws past this boundary.
    async fn create(
        &self,
        worker: &Worker,
        session_id: SessionId,
        provision_action: i32,
    ) -> Result<CreatedJob>;

    /// Best-effort stop. A failure means "stop requested, outcome unknown";
    /// the caller still transitions the session locally.
    async fn stop(&self, worker: &Worker, route: &str) -> Result<()>;

    /// Proxy the worker's raw log text for a job.
    async fn fetch_log(&self, worker: &Worker, route: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct WorkerClientConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for WorkerClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// reqwest-backed implementation of the worker contract.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(config: WorkerClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| {
                BrokerError::Internal(format!(
                    "failed to build worker HTTP client: {e}"
                ))
            })?;
        Ok(Self { client })
    }

    /// Send a request, retrying exactly once on transport-level failure
    /// (connect errors and timeouts). HTTP error statuses come back as
    /// `Ok` responses and are judged by the caller.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        match build().send().await {
            Ok(response) => Ok(response),
            Err(err) if err.is_connect() || err.is_timeout() => {
                debug!(error = %err, "worker call transport failure, retrying once");
                build().send().await
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn create(
        &self,
        worker: &Worker,
        session_id: SessionId,
        provision_action: i32,
    ) -> Result<CreatedJob> {
        let endpoints = WorkerEndpoints::new(&worker.base_address);
        let url = endpoints.create_url();
        let body = CreateJobRequest {
            session_id,
            provision_action,
        };

        let response = self
            .send_with_retry(|| self.client.post(&url).json(&body))
            .await
            .map_err(|e| {
                BrokerError::ProvisionFailed(format!(
                    "worker {} unreachable: {e}",
                    worker.id
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::ProvisionFailed(format!(
                "worker {} answered {status} to create",
                worker.id
            )));
        }

        response.json::<CreatedJob>().await.map_err(|e| {
            BrokerError::ProvisionFailed(format!(
                "worker {} returned malformed create response: {e}",
                worker.id
            ))
        })
    }

    async fn stop(&self, worker: &Worker, route: &str) -> Result<()> {
        let endpoints = WorkerEndpoints::new(&worker.base_address);
        let url = endpoints.stop_url(route);

        let response = self
            .send_with_retry(|| self.client.post(&url))
            .await
            .map_err(|e| {
                BrokerError::WorkerUnreachable(format!(
                    "stop call to worker {} failed: {e}",
                    worker.id
                ))
            })?;

        if !response.status().is_success() {
            warn!(
                worker_id = %worker.id,
                status = %response.status(),
                "worker answered non-2xx to stop"
            );
            return Err(BrokerError::WorkerUnreachable(format!(
                "worker {} answered {} to stop",
                worker.id,
                response.status()
            )));
        }
        Ok(())
    }

    async fn fetch_log(&self, worker: &Worker, route: &str) -> Result<String> {
        let endpoints = WorkerEndpoints::new(&worker.base_address);
        let url = endpoints.log_url(route);

        let response = self
            .send_with_retry(|| self.client.get(&url))
            .await
            .map_err(|e| {
                BrokerError::WorkerUnreachable(format!(
                    "log call to worker {} failed: {e}",
                    worker.id
                ))
            })?;

        if !response.status().is_success() {
            return Err(BrokerError::WorkerUnreachable(format!(
                "worker {} answered {} to log fetch",
                worker.id,
                response.status()
            )));
        }

        response.text().await.map_err(|e| {
            BrokerError::WorkerUnreachable(format!(
                "failed to read log body from worker {}: {e}",
                worker.id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_compose_from_base_address() {
        let endpoints = WorkerEndpoints::new("http://10.1.0.7:9000/");
        assert_eq!(
            endpoints.create_url(),
            "http://10.1.0.7:9000/job/create"
        );
        assert_eq!(
            endpoints.stop_url("q1"),
            "http://10.1.0.7:9000/job/stop/q1"
        );
        assert_eq!(
            endpoints.log_url("q1"),
            "http://10.1.0.7:9000/job/log/q1"
        );
    }
}
