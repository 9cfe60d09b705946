//! Agent configuration, loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    // Identity
    pub agent_id: String,
    pub agent_name: String,
    pub agent_host: String,
    pub agent_port: u16,
    pub controller_url: String,
    pub registration_token: Option<String>,
    pub is_local: bool,

    // Providers
    pub enable_docker: bool,
    pub enable_libvirt: bool,
    pub libvirt_uri: String,
    pub qcow2_store_path: Option<String>,

    // Networking
    pub enable_vxlan: bool,
    pub enable_ovs: bool,
    pub enable_ovs_plugin: bool,
    pub ovs_vlan_start: u16,
    pub ovs_vlan_end: u16,
    pub vxlan_vni_base: u32,
    pub vxlan_vni_max: u32,
    pub plugin_vxlan_vni_base: u32,
    pub plugin_vxlan_vni_max: u32,
    pub plugin_vxlan_dst_port: u16,
    pub mgmt_network_subnet_base: String,
    pub mgmt_network_enable_nat: bool,

    // Timeouts
    pub deploy_timeout: Duration,
    pub destroy_timeout: Duration,
    pub lock_acquire_timeout: Duration,
    pub lock_ttl: Duration,
    pub lock_extend_interval: Duration,
    pub heartbeat_interval: Duration,
    pub registration_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub container_stop_timeout: Duration,

    // Locks / Redis
    pub redis_url: String,
    pub lock_stuck_threshold: Duration,

    // Capacity
    pub max_concurrent_jobs: u32,

    // Workspace
    pub workspace_path: PathBuf,

    // Lab TTL cleanup
    pub lab_ttl_enabled: bool,
    pub lab_ttl: Duration,
    pub lab_ttl_check_interval: Duration,

    // Callback delivery
    pub callback_retry_delays: Vec<Duration>,
    pub callback_timeout: Duration,

    // Logging
    pub log_format: String,
    pub log_level: String,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let agent_id = std::env::var("AGENT_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()[..8].to_string());

        Self {
            agent_id,
            agent_name: env_or("AGENT_NAME", "default"),
            agent_host: env_or("AGENT_HOST", "0.0.0.0"),
            agent_port: env_parse("AGENT_PORT", 8001),
            controller_url: env_or("CONTROLLER_URL", "http://localhost:8000"),
            registration_token: std::env::var("AGENT_REGISTRATION_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            is_local: env_bool("AGENT_IS_LOCAL", false),

            enable_docker: env_bool("AGENT_ENABLE_DOCKER", true),
            enable_libvirt: env_bool("AGENT_ENABLE_LIBVIRT", false),
            libvirt_uri: env_or("AGENT_LIBVIRT_URI", "qemu:///system"),
            qcow2_store_path: std::env::var("AGENT_QCOW2_STORE_PATH")
                .ok()
                .filter(|v| !v.is_empty()),

            enable_vxlan: env_bool("AGENT_ENABLE_VXLAN", true),
            enable_ovs: env_bool("AGENT_ENABLE_OVS", true),
            enable_ovs_plugin: env_bool("AGENT_ENABLE_OVS_PLUGIN", true),
            ovs_vlan_start: env_parse("AGENT_OVS_VLAN_START", 100),
            ovs_vlan_end: env_parse("AGENT_OVS_VLAN_END", 4000),
            vxlan_vni_base: env_parse("AGENT_VXLAN_VNI_BASE", 100_000),
            vxlan_vni_max: env_parse("AGENT_VXLAN_VNI_MAX", 199_999),
            plugin_vxlan_vni_base: env_parse("AGENT_PLUGIN_VXLAN_VNI_BASE", 200_000),
            plugin_vxlan_vni_max: env_parse("AGENT_PLUGIN_VXLAN_VNI_MAX", 299_999),
            plugin_vxlan_dst_port: env_parse("AGENT_PLUGIN_VXLAN_DST_PORT", 4789),
            mgmt_network_subnet_base: env_or("AGENT_MGMT_SUBNET_BASE", "172.20.0.0/16"),
            mgmt_network_enable_nat: env_bool("AGENT_MGMT_ENABLE_NAT", true),

            deploy_timeout: env_secs("AGENT_DEPLOY_TIMEOUT", 900),
            destroy_timeout: env_secs("AGENT_DESTROY_TIMEOUT", 300),
            lock_acquire_timeout: env_secs("AGENT_LOCK_ACQUIRE_TIMEOUT", 30),
            lock_ttl: env_secs("AGENT_LOCK_TTL", 120),
            lock_extend_interval: env_secs("AGENT_LOCK_EXTEND_INTERVAL", 30),
            heartbeat_interval: env_secs("AGENT_HEARTBEAT_INTERVAL", 10),
            registration_timeout: env_secs("AGENT_REGISTRATION_TIMEOUT", 10),
            heartbeat_timeout: env_secs("AGENT_HEARTBEAT_TIMEOUT", 5),
            container_stop_timeout: env_secs("AGENT_CONTAINER_STOP_TIMEOUT", 10),

            redis_url: env_or("REDIS_URL", "redis://redis:6379/0"),
            lock_stuck_threshold: env_secs("AGENT_LOCK_STUCK_THRESHOLD", 900),

            max_concurrent_jobs: env_parse("AGENT_MAX_CONCURRENT_JOBS", 4),

            workspace_path: PathBuf::from(env_or("AGENT_WORKSPACE", "/var/lib/trellis-agent")),

            lab_ttl_enabled: env_bool("AGENT_LAB_TTL_ENABLED", false),
            lab_ttl: env_secs("AGENT_LAB_TTL_SECONDS", 86_400),
            lab_ttl_check_interval: env_secs("AGENT_LAB_TTL_CHECK_INTERVAL", 3_600),

            callback_retry_delays: parse_delays(
                &env_or("AGENT_CALLBACK_RETRY_DELAYS", "10,30,60"),
            ),
            callback_timeout: env_secs("AGENT_CALLBACK_TIMEOUT", 30),

            log_format: env_or("LOG_FORMAT", "json"),
            log_level: env_or("LOG_LEVEL", "info"),
        }
    }

    /// Address the controller should use to reach this agent. A 0.0.0.0 bind
    /// is unroutable from the controller, so fall back to the agent name.
    pub fn advertised_address(&self) -> String {
        if self.agent_host == "0.0.0.0" {
            format!("{}:{}", self.agent_name, self.agent_port)
        } else {
            format!("{}:{}", self.agent_host, self.agent_port)
        }
    }

    pub fn lab_workspace(&self, lab_id: &str) -> PathBuf {
        self.workspace_path.join(lab_id)
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

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn parse_delays(raw: &str) -> Vec<Duration> {
    let delays: Vec<Duration> = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .collect();
    if delays.is_empty() {
        vec![
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ]
    } else {
        delays
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_delays_accepts_comma_list() {
        let delays = parse_delays("1, 2,3");
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3)
            ]
        );
    }

    #[test]
    fn parse_delays_falls_back_on_garbage() {
        assert_eq!(parse_delays("nope").len(), 3);
    }
}
