//! Wire types shared by the Trellis controller and agents.
//!
//! Every request/response exchanged over the agent protocol lives here so
//! both sides serialize from the same definitions. Field names are part of
//! the protocol; do not rename without versioning.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    /// Terminal response for callback-mode jobs: the agent took the job and
    /// will report the outcome via the callback URL.
    Accepted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Docker,
    Libvirt,
    /// Deprecated legacy provider. Accepted on the wire for compatibility,
    /// rejected at execution time.
    Containerlab,
}

// --- Registration & heartbeat ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub providers: Vec<Provider>,
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub name: String,
    /// host:port (or full URL) the controller can reach this agent at.
    pub address: String,
    pub capabilities: AgentCapabilities,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub is_local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub agent: AgentInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub active_jobs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
}

// --- Job execution ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub job_id: String,
    pub lab_id: String,
    pub topology_yaml: String,
    pub provider: Provider,
    /// When set the agent answers 202 immediately and POSTs a
    /// `CallbackPayload` here once the job finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub job_id: String,
    pub lab_id: String,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeActionRequest {
    pub job_id: String,
    pub lab_id: String,
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub action: NodeAction,
}

impl NodeActionRequest {
    /// Node name for logs: `DisplayName(id)` when they differ, else the id.
    pub fn log_name(&self) -> String {
        match &self.display_name {
            Some(display) if display != &self.node_name => {
                format!("{display}({})", self.node_name)
            }
            _ => self.node_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub job_id: String,
    pub agent_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_states: Option<std::collections::HashMap<String, NodeStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

// --- Status queries ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabStatusRequest {
    pub lab_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabStatusResponse {
    pub lab_id: String,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredLab {
    pub lab_id: String,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverLabsResponse {
    #[serde(default)]
    pub labs: Vec<DiscoveredLab>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupOrphansRequest {
    #[serde(default)]
    pub valid_lab_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupOrphansResponse {
    #[serde(default)]
    pub removed_containers: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

// --- Overlay networking ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    pub lab_id: String,
    /// Canonical link identifier, e.g. `r1:eth1-r2:eth1`.
    pub link_id: String,
    pub local_ip: String,
    pub remote_ip: String,
    /// Allocated by the first side when absent; the second side must reuse it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vni: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub vni: u32,
    pub interface_name: String,
    pub local_ip: String,
    pub remote_ip: String,
    pub lab_id: String,
    pub link_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachContainerRequest {
    pub lab_id: String,
    pub link_id: String,
    pub container_name: String,
    pub interface_name: String,
    /// Optional CIDR address configured on the interface after attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachContainerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupOverlayRequest {
    pub lab_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupOverlayResponse {
    #[serde(default)]
    pub tunnels_deleted: u32,
    #[serde(default)]
    pub bridges_deleted: u32,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayBridgeInfo {
    pub name: String,
    pub vni: u32,
    pub lab_id: String,
    pub link_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayStatusResponse {
    #[serde(default)]
    pub tunnels: Vec<TunnelInfo>,
    #[serde(default)]
    pub bridges: Vec<OverlayBridgeInfo>,
}

// --- Hot-connect link management ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connected,
    Disconnected,
    Pending,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCreate {
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub link_id: String,
    pub lab_id: String,
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
    pub state: LinkState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCreateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDeleteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkListResponse {
    #[serde(default)]
    pub links: Vec<LinkInfo>,
}

// --- Plugin fabric (lab-bridge VXLAN + external interfaces) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginVxlanRequest {
    pub lab_id: String,
    pub link_id: String,
    pub local_ip: String,
    pub remote_ip: String,
    pub vni: u32,
    pub vlan_tag: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginVxlanResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAttachRequest {
    pub lab_id: String,
    pub external_interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAttachResponse {
    pub success: bool,
    #[serde(default)]
    pub vlan_tag: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConnectRequest {
    pub lab_id: String,
    pub container_name: String,
    pub interface_name: String,
    pub external_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConnectResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalInterfaceInfo {
    pub interface: String,
    pub vlan_tag: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalListResponse {
    pub lab_id: String,
    #[serde(default)]
    pub interfaces: Vec<ExternalInterfaceInfo>,
}

// --- Deploy locks ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStatus {
    pub lab_id: String,
    pub held: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub age_seconds: f64,
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub is_stuck: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockListResponse {
    #[serde(default)]
    pub locks: Vec<LockStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_wire_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Accepted).unwrap(),
            "\"accepted\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"failed\"").unwrap(),
            JobStatus::Failed
        );
    }

    #[test]
    fn deploy_request_omits_absent_callback_url() {
        let req = DeployRequest {
            job_id: "job-1".into(),
            lab_id: "lab-1".into(),
            topology_yaml: "nodes: {}".into(),
            provider: Provider::Docker,
            callback_url: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("callback_url").is_none());
        assert_eq!(json["provider"], "docker");
    }

    #[test]
    fn callback_payload_round_trips() {
        let payload = CallbackPayload {
            job_id: "job-2".into(),
            agent_id: "agent-a".into(),
            status: JobStatus::Completed,
            stdout: "Deployed 2 containers".into(),
            stderr: String::new(),
            error_message: None,
            node_states: Some(
                [("r1".to_string(), NodeStatus::Running)].into_iter().collect(),
            ),
            started_at: Some(chrono::Utc::now()),
            completed_at: Some(chrono::Utc::now()),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: CallbackPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, JobStatus::Completed);
        assert_eq!(
            back.node_states.unwrap().get("r1"),
            Some(&NodeStatus::Running)
        );
    }

    #[test]
    fn node_action_log_name_formats() {
        let req = NodeActionRequest {
            job_id: "j".into(),
            lab_id: "l".into(),
            node_name: "r1".into(),
            display_name: Some("Core Router".into()),
            action: NodeAction::Start,
        };
        assert_eq!(req.log_name(), "Core Router(r1)");

        let plain = NodeActionRequest {
            display_name: None,
            ..req
        };
        assert_eq!(plain.log_name(), "r1");
    }
}
