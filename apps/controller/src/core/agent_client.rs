//! HTTP client for talking to agents.
//!
//! Transport failures (connect errors, timeouts) retry with exponential
//! backoff; HTTP-level errors are application errors and surface immediately
//! with the agent's message.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};
use trellis_types::{
    AttachContainerRequest, AttachContainerResponse, CleanupOrphansRequest,
    CleanupOrphansResponse, CleanupOverlayRequest, CleanupOverlayResponse, CreateTunnelRequest,
    CreateTunnelResponse, DeployRequest, DestroyRequest, DiscoverLabsResponse, JobResult,
    LabStatusRequest, LabStatusResponse, NodeActionRequest, OverlayStatusResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum AgentClientError {
    #[error("agent unreachable: {0}")]
    Unavailable(String),
    #[error("agent returned HTTP {status}: {message}")]
    Application { status: u16, message: String },
}

impl AgentClientError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(1 << attempt.min(16));
        exp.min(self.backoff_max)
    }
}

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    retry: RetryPolicy,
    deploy_timeout: Duration,
    destroy_timeout: Duration,
    default_timeout: Duration,
}

pub fn agent_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", address.trim_end_matches('/'))
    }
}

impl AgentClient {
    pub fn new(deploy_timeout: Duration, destroy_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            retry,
            deploy_timeout,
            destroy_timeout,
            default_timeout: Duration::from_secs(30),
        }
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, AgentClientError> {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        decode(response).await
    }

    async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<R, AgentClientError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_reqwest)?;
        decode(response).await
    }

    /// Retry `operation` on transport errors only, with exponential backoff.
    async fn with_retry<R, F, Fut>(
        &self,
        max_retries: u32,
        mut operation: F,
    ) -> Result<R, AgentClientError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<R, AgentClientError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retriable() && attempt < max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = max_retries + 1,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "agent request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // --- Jobs ---

    pub async fn deploy(
        &self,
        address: &str,
        request: &DeployRequest,
    ) -> Result<JobResult, AgentClientError> {
        let url = format!("{}/jobs/deploy", agent_url(address));
        info!(lab_id = %request.lab_id, job_id = %request.job_id, url = %url, "dispatching deploy");
        // Deploys are long and the agent deduplicates via its lock; retrying
        // more than once just queues behind ourselves.
        self.with_retry(1, || self.post_json(&url, request, self.deploy_timeout))
            .await
    }

    pub async fn destroy(
        &self,
        address: &str,
        request: &DestroyRequest,
    ) -> Result<JobResult, AgentClientError> {
        let url = format!("{}/jobs/destroy", agent_url(address));
        self.with_retry(self.retry.max_retries, || {
            self.post_json(&url, request, self.destroy_timeout)
        })
        .await
    }

    pub async fn node_action(
        &self,
        address: &str,
        request: &NodeActionRequest,
    ) -> Result<JobResult, AgentClientError> {
        let url = format!("{}/jobs/node-action", agent_url(address));
        self.with_retry(self.retry.max_retries, || {
            self.post_json(&url, request, Duration::from_secs(150))
        })
        .await
    }

    // --- Status & reconciliation ---

    pub async fn lab_status(
        &self,
        address: &str,
        lab_id: &str,
    ) -> Result<LabStatusResponse, AgentClientError> {
        let url = format!("{}/labs/status", agent_url(address));
        let request = LabStatusRequest {
            lab_id: lab_id.to_string(),
        };
        self.with_retry(1, || self.post_json(&url, &request, self.default_timeout))
            .await
    }

    pub async fn discover_labs(
        &self,
        address: &str,
    ) -> Result<DiscoverLabsResponse, AgentClientError> {
        let url = format!("{}/discover-labs", agent_url(address));
        self.get_json(&url, self.default_timeout).await
    }

    pub async fn cleanup_orphans(
        &self,
        address: &str,
        valid_lab_ids: Vec<String>,
    ) -> Result<CleanupOrphansResponse, AgentClientError> {
        let url = format!("{}/cleanup-orphans", agent_url(address));
        let request = CleanupOrphansRequest { valid_lab_ids };
        self.post_json(&url, &request, Duration::from_secs(120)).await
    }

    pub async fn health(&self, address: &str) -> bool {
        let url = format!("{}/health", agent_url(address));
        matches!(
            self.get_json::<serde_json::Value>(&url, Duration::from_secs(5)).await,
            Ok(_)
        )
    }

    // --- Overlay ---

    pub async fn create_tunnel(
        &self,
        address: &str,
        request: &CreateTunnelRequest,
    ) -> Result<CreateTunnelResponse, AgentClientError> {
        let url = format!("{}/overlay/tunnel", agent_url(address));
        self.post_json(&url, request, self.default_timeout).await
    }

    pub async fn attach_container(
        &self,
        address: &str,
        request: &AttachContainerRequest,
    ) -> Result<AttachContainerResponse, AgentClientError> {
        let url = format!("{}/overlay/attach", agent_url(address));
        self.post_json(&url, request, self.default_timeout).await
    }

    pub async fn cleanup_overlay(
        &self,
        address: &str,
        lab_id: &str,
    ) -> Result<CleanupOverlayResponse, AgentClientError> {
        let url = format!("{}/overlay/cleanup", agent_url(address));
        let request = CleanupOverlayRequest {
            lab_id: lab_id.to_string(),
        };
        self.post_json(&url, &request, Duration::from_secs(60)).await
    }

    pub async fn overlay_status(
        &self,
        address: &str,
    ) -> Result<OverlayStatusResponse, AgentClientError> {
        let url = format!("{}/overlay/status", agent_url(address));
        self.get_json(&url, Duration::from_secs(10)).await
    }

    // --- Locks ---

    pub async fn release_lock(
        &self,
        address: &str,
        lab_id: &str,
    ) -> Result<serde_json::Value, AgentClientError> {
        let url = format!("{}/locks/{lab_id}/release", agent_url(address));
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(classify_reqwest)?;
        decode(response).await
    }
}

fn classify_reqwest(err: reqwest::Error) -> AgentClientError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        AgentClientError::Unavailable(err.to_string())
    } else {
        AgentClientError::Application {
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            message: err.to_string(),
        }
    }
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, AgentClientError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(AgentClientError::Application {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<R>()
        .await
        .map_err(|err| AgentClientError::Application {
            status: status.as_u16(),
            message: format!("unreadable response body: {err}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> AgentClient {
        AgentClient::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
            RetryPolicy {
                max_retries: 2,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(20),
            },
        )
    }

    #[test]
    fn agent_url_normalizes_addresses() {
        assert_eq!(agent_url("10.0.0.5:8001"), "http://10.0.0.5:8001");
        assert_eq!(agent_url("http://agent-a:8001/"), "http://agent-a:8001");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn http_errors_are_application_errors_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/discover-labs"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client().discover_labs(&server.uri()).await.unwrap_err();
        match err {
            AgentClientError::Application { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("expected application error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_responses_decode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/discover-labs"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"labs": []})),
            )
            .mount(&server)
            .await;

        let response = client().discover_labs(&server.uri()).await.unwrap();
        assert!(response.labs.is_empty());
    }
}
