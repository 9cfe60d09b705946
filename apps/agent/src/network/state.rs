//! Persistent state for the Docker network plugin.
//!
//! Flat tables keyed by id (bridges by lab, networks by network id,
//! endpoints by endpoint id) with foreign-key fields, so cross references
//! stay queryable map scans instead of a pointer graph. The whole structure
//! serializes to one JSON file; writes go through a temp file and an atomic
//! rename so the on-disk state is never half-written.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const STATE_FILE_NAME: &str = "docker_ovs_plugin_state.json";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabBridge {
    pub lab_id: String,
    pub bridge_name: String,
    /// VLAN allocator cursor, persisted so a restart does not re-issue
    /// recently released tags to unrelated endpoints.
    pub next_vlan: u16,
    #[serde(default)]
    pub network_ids: BTreeSet<String>,
    pub last_activity: DateTime<Utc>,
    /// vni -> OVS port name
    #[serde(default)]
    pub vxlan_tunnels: BTreeMap<u32, String>,
    /// host interface -> vlan tag (0 = trunk)
    #[serde(default)]
    pub external_ports: BTreeMap<String, u16>,
}

impl LabBridge {
    pub fn new(lab_id: &str, bridge_name: &str, vlan_start: u16) -> Self {
        Self {
            lab_id: lab_id.to_string(),
            bridge_name: bridge_name.to_string(),
            next_vlan: vlan_start,
            network_ids: BTreeSet::new(),
            last_activity: Utc::now(),
            vxlan_tunnels: BTreeMap::new(),
            external_ports: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkState {
    pub network_id: String,
    pub lab_id: String,
    /// Interface slot this network provisions (eth1, eth2, ...).
    pub interface_name: String,
    pub bridge_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointState {
    pub endpoint_id: String,
    pub network_id: String,
    pub interface_name: String,
    pub host_veth: String,
    pub cont_veth: String,
    pub vlan_tag: u16,
    /// Docker only binds the container at Join time, and Join does not carry
    /// the name; the provider fills this in after container creation.
    #[serde(default)]
    pub container_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementNetwork {
    pub lab_id: String,
    pub network_id: String,
    pub network_name: String,
    pub subnet: String,
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub lab_bridges: BTreeMap<String, LabBridge>,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkState>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointState>,
    #[serde(default)]
    pub management_networks: BTreeMap<String, ManagementNetwork>,
    #[serde(default = "default_subnet_index")]
    pub next_mgmt_subnet_index: u8,
}

fn default_subnet_index() -> u8 {
    1
}

impl Default for PluginState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            lab_bridges: BTreeMap::new(),
            networks: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            management_networks: BTreeMap::new(),
            next_mgmt_subnet_index: 1,
        }
    }
}

impl PluginState {
    pub fn lab_id_of_endpoint(&self, endpoint: &EndpointState) -> Option<&str> {
        self.networks
            .get(&endpoint.network_id)
            .map(|net| net.lab_id.as_str())
    }

    pub fn endpoints_for_lab<'a>(
        &'a self,
        lab_id: &'a str,
    ) -> impl Iterator<Item = &'a EndpointState> {
        self.endpoints.values().filter(move |ep| {
            self.lab_id_of_endpoint(ep)
                .is_some_and(|owner| owner == lab_id)
        })
    }

    pub fn find_endpoint(&self, container_name: &str, interface_name: &str) -> Option<&EndpointState> {
        self.endpoints.values().find(|ep| {
            ep.container_name.as_deref() == Some(container_name)
                && ep.interface_name == interface_name
        })
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            path: workspace.join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomic write: serialize, write `<path>.tmp`, rename over `<path>`.
    pub async fn save(&self, state: &PluginState) -> Result<()> {
        let mut snapshot = state.clone();
        snapshot.version = STATE_VERSION;
        snapshot.saved_at = Utc::now();

        let body = serde_json::to_vec_pretty(&snapshot)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }

    /// Load persisted state. `None` when the file is absent (fresh host,
    /// caller falls back to OVS discovery) or unparseable (logged, treated
    /// as fresh).
    pub async fn load(&self) -> Option<PluginState> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no persisted plugin state, starting fresh");
                return None;
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not read plugin state");
                return None;
            }
        };

        match serde_json::from_slice::<PluginState>(&raw) {
            Ok(state) => {
                if state.version != STATE_VERSION {
                    warn!(
                        version = state.version,
                        "unknown state file version, attempting load anyway"
                    );
                }
                info!(
                    bridges = state.lab_bridges.len(),
                    networks = state.networks.len(),
                    endpoints = state.endpoints.len(),
                    "loaded plugin state"
                );
                Some(state)
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "corrupt plugin state, starting fresh");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> PluginState {
        let mut state = PluginState::default();
        let mut bridge = LabBridge::new("lab-abc123def456", "ovs-lab-abc123d", 100);
        bridge.network_ids.insert("net-1".into());
        bridge.vxlan_tunnels.insert(200_001, "vx200001".into());
        bridge.external_ports.insert("enp0s8".into(), 0);
        state.lab_bridges.insert("lab-abc123def456".into(), bridge);
        state.networks.insert(
            "net-1".into(),
            NetworkState {
                network_id: "net-1".into(),
                lab_id: "lab-abc123def456".into(),
                interface_name: "eth1".into(),
                bridge_name: "ovs-lab-abc123d".into(),
            },
        );
        state.endpoints.insert(
            "ep-1".into(),
            EndpointState {
                endpoint_id: "ep-1".into(),
                network_id: "net-1".into(),
                interface_name: "eth1".into(),
                host_veth: "vhep1a2b3c".into(),
                cont_veth: "vcep1a2b3c".into(),
                vlan_tag: 101,
                container_name: Some("trellis-lab-r1".into()),
            },
        );
        state.management_networks.insert(
            "lab-abc123def456".into(),
            ManagementNetwork {
                lab_id: "lab-abc123def456".into(),
                network_id: "mgmt-net".into(),
                network_name: "trellis-mgmt-lab-abc123def456".into(),
                subnet: "172.20.1.0/24".into(),
                gateway: "172.20.1.1".into(),
            },
        );
        state.next_mgmt_subnet_index = 2;
        state
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = sample_state();

        store.save(&state).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded.lab_bridges.len(), 1);
        let bridge = &loaded.lab_bridges["lab-abc123def456"];
        assert_eq!(bridge.bridge_name, "ovs-lab-abc123d");
        assert_eq!(bridge.vxlan_tunnels[&200_001], "vx200001");
        assert_eq!(loaded.endpoints["ep-1"].vlan_tag, 101);
        assert_eq!(loaded.next_mgmt_subnet_index, 2);
        assert_eq!(
            loaded.endpoints["ep-1"].container_name.as_deref(),
            Some("trellis-lab-r1")
        );
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&PluginState::default()).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![STATE_FILE_NAME.to_string()]);
    }

    #[tokio::test]
    async fn corrupt_state_loads_as_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::write(store.path(), b"{ not json").unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn missing_state_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load().await.is_none());
    }

    #[test]
    fn endpoint_lab_lookup_goes_through_network_table() {
        let state = sample_state();
        let ep = &state.endpoints["ep-1"];
        assert_eq!(state.lab_id_of_endpoint(ep), Some("lab-abc123def456"));
        assert_eq!(state.endpoints_for_lab("lab-abc123def456").count(), 1);
        assert_eq!(state.endpoints_for_lab("other").count(), 0);
    }
}
