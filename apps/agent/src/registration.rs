//! Registration and heartbeat against the controller.
//!
//! The agent registers once at startup, then heartbeats on an interval. A
//! failed heartbeat flips the local flag back to unregistered; the next tick
//! re-registers instead of heartbeating.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{info, warn};
use trellis_types::{
    AgentCapabilities, AgentInfo, AgentStatus, HeartbeatRequest, Provider, RegistrationRequest,
    RegistrationResponse,
};

use crate::config::AgentConfig;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Registration {
    cfg: AgentConfig,
    http: reqwest::Client,
    registered: AtomicBool,
    active_jobs: AtomicU32,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl Registration {
    pub fn new(cfg: AgentConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            registered: AtomicBool::new(false),
            active_jobs: AtomicU32::new(0),
            started_at: chrono::Utc::now(),
        }
    }

    pub fn agent_info(&self) -> AgentInfo {
        AgentInfo {
            agent_id: self.cfg.agent_id.clone(),
            name: self.cfg.agent_name.clone(),
            address: self.cfg.advertised_address(),
            capabilities: self.capabilities(),
            version: AGENT_VERSION.to_string(),
            started_at: Some(self.started_at),
            is_local: self.cfg.is_local,
        }
    }

    pub fn capabilities(&self) -> AgentCapabilities {
        let mut providers = Vec::new();
        if self.cfg.enable_docker {
            providers.push(Provider::Docker);
        }
        if self.cfg.enable_libvirt {
            providers.push(Provider::Libvirt);
        }

        let mut features = vec!["console".to_string(), "status".to_string()];
        if self.cfg.enable_vxlan {
            features.push("vxlan".to_string());
        }
        if self.cfg.enable_ovs && self.cfg.enable_ovs_plugin {
            features.push("ovs-plugin".to_string());
            features.push("hot-connect".to_string());
        }

        AgentCapabilities {
            providers,
            max_concurrent_jobs: self.cfg.max_concurrent_jobs,
            features,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn job_started(&self) {
        self.active_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self) {
        let _ = self
            .active_jobs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn active_jobs(&self) -> u32 {
        self.active_jobs.load(Ordering::Relaxed)
    }

    pub async fn register(&self) -> bool {
        let request = RegistrationRequest {
            agent: self.agent_info(),
            token: self.cfg.registration_token.clone(),
        };
        let url = format!(
            "{}/agents/register",
            self.cfg.controller_url.trim_end_matches('/')
        );

        match self
            .http
            .post(&url)
            .timeout(self.cfg.registration_timeout)
            .json(&request)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                match response.json::<RegistrationResponse>().await {
                    Ok(body) if body.success => {
                        self.registered.store(true, Ordering::Relaxed);
                        info!(agent_id = %self.cfg.agent_id, "registered with controller");
                        true
                    }
                    Ok(body) => {
                        warn!(message = %body.message, "registration rejected");
                        false
                    }
                    Err(err) => {
                        warn!(error = %err, "unreadable registration response");
                        false
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "registration failed");
                false
            }
            Err(err) => {
                warn!(controller = %self.cfg.controller_url, error = %err, "cannot reach controller");
                false
            }
        }
    }

    async fn heartbeat(&self) -> bool {
        let request = HeartbeatRequest {
            agent_id: self.cfg.agent_id.clone(),
            status: AgentStatus::Online,
            active_jobs: self.active_jobs(),
        };
        let url = format!(
            "{}/agents/{}/heartbeat",
            self.cfg.controller_url.trim_end_matches('/'),
            self.cfg.agent_id
        );

        match self
            .http
            .post(&url)
            .timeout(self.cfg.heartbeat_timeout)
            .json(&request)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "heartbeat rejected");
                false
            }
            Err(err) => {
                warn!(error = %err, "heartbeat failed");
                false
            }
        }
    }

    /// Register, then heartbeat forever. Runs as a background task for the
    /// life of the process.
    pub fn spawn_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registration = Arc::clone(self);
        tokio::spawn(async move {
            registration.register().await;

            let mut ticker = tokio::time::interval(registration.cfg.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !registration.is_registered() {
                    registration.register().await;
                    continue;
                }
                if !registration.heartbeat().await {
                    warn!("lost contact with controller, will re-register");
                    registration.registered.store(false, Ordering::Relaxed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server_uri: &str) -> AgentConfig {
        let mut cfg = AgentConfig::from_env();
        cfg.agent_id = "agent-test".to_string();
        cfg.controller_url = server_uri.to_string();
        cfg
    }

    #[tokio::test]
    async fn register_sets_flag_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/register"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true, "message": ""})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let registration = Registration::new(config_for(&server.uri()));
        assert!(registration.register().await);
        assert!(registration.is_registered());
    }

    #[tokio::test]
    async fn rejected_registration_leaves_flag_clear() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"success": false, "message": "bad token"}),
            ))
            .mount(&server)
            .await;

        let registration = Registration::new(config_for(&server.uri()));
        assert!(!registration.register().await);
        assert!(!registration.is_registered());
    }

    #[test]
    fn active_job_counter_saturates_at_zero() {
        let registration = Registration::new(AgentConfig::from_env());
        registration.job_finished();
        assert_eq!(registration.active_jobs(), 0);
        registration.job_started();
        registration.job_started();
        registration.job_finished();
        assert_eq!(registration.active_jobs(), 1);
    }

    #[test]
    fn docker_capability_follows_config() {
        let mut cfg = AgentConfig::from_env();
        cfg.enable_docker = true;
        cfg.enable_libvirt = false;
        let caps = Registration::new(cfg).capabilities();
        assert!(caps.providers.contains(&Provider::Docker));
        assert!(!caps.providers.contains(&Provider::Libvirt));
    }
}
