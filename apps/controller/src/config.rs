//! Controller configuration, loaded from the environment.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bind: String,
    pub database_url: String,
    /// Base URL agents can reach this controller at. When set, single-host
    /// deploys run in callback mode instead of holding the HTTP request.
    pub public_url: Option<String>,
    pub registration_token: Option<String>,
    pub agent_deploy_timeout: Duration,
    pub agent_destroy_timeout: Duration,
    pub agent_max_retries: u32,
    pub log_format: String,
    pub log_level: String,
}

impl ControllerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bind: env_or("CONTROLLER_BIND", "0.0.0.0:8000"),
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?,
            public_url: std::env::var("CONTROLLER_PUBLIC_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            registration_token: std::env::var("CONTROLLER_REGISTRATION_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            agent_deploy_timeout: env_secs("CONTROLLER_AGENT_DEPLOY_TIMEOUT", 900),
            agent_destroy_timeout: env_secs("CONTROLLER_AGENT_DESTROY_TIMEOUT", 300),
            agent_max_retries: env_parse("CONTROLLER_AGENT_MAX_RETRIES", 3),
            log_format: env_or("LOG_FORMAT", "json"),
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}
