//! Docker network plugin backed by Open vSwitch.
//!
//! One OVS bridge per lab; one Docker network per interface slot; one veth
//! pair per container NIC. Endpoints are provisioned during `CreateEndpoint`
//! and handed to Docker at `Join`, so the interface exists, carries its
//! topology name and sits on the lab bridge before the container's init
//! process runs. Every endpoint is born with its own VLAN tag and therefore
//! isolated; links are made and broken by retagging ports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use axum::extract::Extension;
use axum::routing::post;
use axum::{Json, Router};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions};
use bollard::Docker;
use chrono::Utc;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::core::{net, ovs};
use crate::network::allocator::TagAllocator;
use crate::network::state::{
    EndpointState, LabBridge, ManagementNetwork, NetworkState, PluginState, StateStore,
};

pub const PLUGIN_NAME: &str = "trellis-ovs";
pub const LABEL_LAB_ID: &str = "trellis.lab_id";
pub const LABEL_TYPE: &str = "trellis.type";

pub fn default_socket_path() -> PathBuf {
    PathBuf::from(format!("/run/docker/plugins/{PLUGIN_NAME}.sock"))
}

pub fn default_spec_path() -> PathBuf {
    PathBuf::from(format!("/etc/docker/plugins/{PLUGIN_NAME}.spec"))
}

#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub vlan_start: u16,
    pub vlan_end: u16,
    pub vxlan_dst_port: u16,
    pub mgmt_subnet_base: String,
    pub mgmt_enable_nat: bool,
    pub lab_ttl_enabled: bool,
    pub lab_ttl: std::time::Duration,
    pub lab_ttl_check_interval: std::time::Duration,
}

impl PluginSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            vlan_start: cfg.ovs_vlan_start,
            vlan_end: cfg.ovs_vlan_end,
            vxlan_dst_port: cfg.plugin_vxlan_dst_port,
            mgmt_subnet_base: cfg.mgmt_network_subnet_base.clone(),
            mgmt_enable_nat: cfg.mgmt_network_enable_nat,
            lab_ttl_enabled: cfg.lab_ttl_enabled,
            lab_ttl: cfg.lab_ttl,
            lab_ttl_check_interval: cfg.lab_ttl_check_interval,
        }
    }
}

struct PluginInner {
    state: PluginState,
    /// Per-lab VLAN allocators, keyed by endpoint id. Rebuilt from persisted
    /// state on load; cursors are synced back into `LabBridge.next_vlan`
    /// before every save.
    vlans: HashMap<String, TagAllocator>,
}

pub struct DockerOvsPlugin {
    settings: PluginSettings,
    ovs: ovs::OvsFabric,
    docker: Docker,
    store: StateStore,
    inner: Mutex<PluginInner>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl DockerOvsPlugin {
    pub fn new(settings: PluginSettings, docker: Docker, workspace: &Path) -> Self {
        Self {
            settings,
            ovs: ovs::OvsFabric::default(),
            docker,
            store: StateStore::new(workspace),
            inner: Mutex::new(PluginInner {
                state: PluginState::default(),
                vlans: HashMap::new(),
            }),
            started_at: Utc::now(),
        }
    }

    pub fn ovs(&self) -> &ovs::OvsFabric {
        &self.ovs
    }

    // =========================================================================
    // Startup: load, reconcile, discover
    // =========================================================================

    /// Load persisted state and align it with OVS reality. With no state
    /// file, fall back to discovering bridges from OVS directly.
    pub async fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match self.store.load().await {
            Some(state) => {
                inner.state = state;
                self.rebuild_allocators(&mut inner);
                self.reconcile(&mut inner).await;
                self.sweep_orphan_ports(&mut inner).await;
                self.persist(&mut inner).await;
            }
            None => {
                self.discover_from_ovs(&mut inner).await;
                self.rebuild_allocators(&mut inner);
                if !inner.state.lab_bridges.is_empty() {
                    self.persist(&mut inner).await;
                }
            }
        }
        Ok(())
    }

    fn rebuild_allocators(&self, inner: &mut PluginInner) {
        inner.vlans.clear();
        for (lab_id, bridge) in &inner.state.lab_bridges {
            let mut alloc = TagAllocator::with_cursor(
                self.settings.vlan_start as u32,
                self.settings.vlan_end as u32,
                bridge.next_vlan as u32,
            );
            for ep in inner.state.endpoints.values() {
                let owner = inner
                    .state
                    .networks
                    .get(&ep.network_id)
                    .map(|net| net.lab_id.as_str());
                if owner == Some(lab_id.as_str()) {
                    alloc.adopt(&ep.endpoint_id, ep.vlan_tag as u32);
                }
            }
            inner.vlans.insert(lab_id.clone(), alloc);
        }
    }

    /// Align persisted state with live OVS: recreate bridges Docker still
    /// references, drop bridges nothing references, drop endpoints whose
    /// veth vanished.
    async fn reconcile(&self, inner: &mut PluginInner) {
        let lab_ids: Vec<String> = inner.state.lab_bridges.keys().cloned().collect();
        for lab_id in lab_ids {
            let (bridge_name, has_networks) = {
                let bridge = &inner.state.lab_bridges[&lab_id];
                (bridge.bridge_name.clone(), !bridge.network_ids.is_empty())
            };
            let exists = self.ovs.bridge_exists(&bridge_name).await.unwrap_or(false);
            if exists {
                continue;
            }
            if has_networks {
                warn!(lab_id = %lab_id, bridge = %bridge_name, "bridge missing but networks reference it, recreating");
                if let Err(err) = self.ovs.ensure_bridge(&bridge_name).await {
                    error!(bridge = %bridge_name, error = %err, "failed to recreate bridge");
                }
            } else {
                info!(lab_id = %lab_id, bridge = %bridge_name, "dropping orphaned bridge state");
                inner.state.lab_bridges.remove(&lab_id);
                inner.vlans.remove(&lab_id);
            }
        }

        let mut stale = Vec::new();
        for (ep_id, ep) in &inner.state.endpoints {
            if !net::link_exists(&ep.host_veth).await {
                info!(endpoint = %short(ep_id), veth = %ep.host_veth, "endpoint veth missing, dropping from state");
                stale.push(ep_id.clone());
            }
        }
        for ep_id in stale {
            self.forget_endpoint(inner, &ep_id);
        }
    }

    fn forget_endpoint(&self, inner: &mut PluginInner, endpoint_id: &str) {
        if let Some(ep) = inner.state.endpoints.remove(endpoint_id) {
            let lab_id = inner
                .state
                .networks
                .get(&ep.network_id)
                .map(|net| net.lab_id.clone());
            if let Some(lab_id) = lab_id {
                if let Some(alloc) = inner.vlans.get_mut(&lab_id) {
                    alloc.release(endpoint_id);
                }
            }
        }
    }

    /// Remove `vh*` ports a crash left on a bridge between `add_port` and the
    /// following state save.
    async fn sweep_orphan_ports(&self, inner: &mut PluginInner) {
        let tracked: std::collections::HashSet<String> = inner
            .state
            .endpoints
            .values()
            .map(|ep| ep.host_veth.clone())
            .collect();

        let bridges: Vec<String> = inner
            .state
            .lab_bridges
            .values()
            .map(|b| b.bridge_name.clone())
            .collect();

        for bridge in bridges {
            let ports = match self.ovs.list_ports(&bridge).await {
                Ok(ports) => ports,
                Err(_) => continue,
            };
            for port in ports {
                if port.starts_with("vh") && !tracked.contains(&port) {
                    warn!(port = %port, bridge = %bridge, "removing orphaned OVS port");
                    let _ = self.ovs.del_port(&bridge, &port).await;
                    let _ = net::delete_link(&port).await;
                }
            }
        }
    }

    /// No state file: rebuild bridge records from live OVS. Endpoint
    /// recovery is intentionally skipped; Docker re-registers endpoints as
    /// containers reconnect.
    async fn discover_from_ovs(&self, inner: &mut PluginInner) {
        let bridges = match self.ovs.list_bridges().await {
            Ok(bridges) => bridges,
            Err(err) => {
                warn!(error = %err, "could not list OVS bridges, skipping discovery");
                return;
            }
        };

        for bridge_name in bridges {
            let Some(lab_prefix) = bridge_name.strip_prefix(ovs::BRIDGE_PREFIX) else {
                continue;
            };

            let ports = self.ovs.list_ports(&bridge_name).await.unwrap_or_default();
            let mut max_vlan = self.settings.vlan_start;
            let mut vxlan_tunnels = std::collections::BTreeMap::new();
            let mut external_ports = std::collections::BTreeMap::new();

            for port in &ports {
                if let Ok(Some(tag)) = self.ovs.get_port_tag(port).await {
                    max_vlan = max_vlan.max(tag);
                }
                match self.ovs.interface_type(port).await.as_deref() {
                    Ok("vxlan") => {
                        if let Ok(Some(vni)) = self.ovs.interface_vni(port).await {
                            vxlan_tunnels.insert(vni, port.clone());
                        }
                    }
                    Ok("system") | Ok("") if !port.starts_with("vh") => {
                        let tag = self.ovs.get_port_tag(port).await.ok().flatten().unwrap_or(0);
                        external_ports.insert(port.clone(), tag);
                    }
                    _ => {}
                }
            }

            let lab_id = self
                .find_lab_id_by_prefix(lab_prefix)
                .await
                .unwrap_or_else(|| lab_prefix.to_string());

            let mut bridge = LabBridge::new(&lab_id, &bridge_name, self.settings.vlan_start);
            bridge.next_vlan = max_vlan.saturating_add(1).min(self.settings.vlan_end);
            bridge.vxlan_tunnels = vxlan_tunnels;
            bridge.external_ports = external_ports;

            info!(
                bridge = %bridge_name,
                lab_id = %lab_id,
                ports = ports.len(),
                "recovered lab bridge from OVS"
            );
            inner.state.lab_bridges.insert(lab_id, bridge);
        }
    }

    /// Best-effort full lab id for a truncated bridge suffix, recovered from
    /// container labels.
    async fn find_lab_id_by_prefix(&self, prefix: &str) -> Option<String> {
        let options = bollard::container::ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![LABEL_LAB_ID.to_string()])]),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await.ok()?;
        for container in containers {
            if let Some(lab_id) = container.labels.as_ref().and_then(|l| l.get(LABEL_LAB_ID)) {
                if lab_id.starts_with(prefix) {
                    return Some(lab_id.clone());
                }
            }
        }
        None
    }

    async fn persist(&self, inner: &mut PluginInner) {
        for (lab_id, alloc) in &inner.vlans {
            if let Some(bridge) = inner.state.lab_bridges.get_mut(lab_id) {
                bridge.next_vlan = alloc.cursor() as u16;
            }
        }
        if let Err(err) = self.store.save(&inner.state).await {
            error!(error = %err, "failed to persist plugin state");
        }
    }

    // =========================================================================
    // Docker driver operations
    // =========================================================================

    async fn create_network(
        &self,
        network_id: &str,
        lab_id: &str,
        interface_name: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let bridge_name = match inner.state.lab_bridges.get(lab_id) {
            Some(bridge) => bridge.bridge_name.clone(),
            None => {
                let name = ovs::bridge_name(lab_id);
                self.ovs.ensure_bridge(&name).await?;
                inner.state.lab_bridges.insert(
                    lab_id.to_string(),
                    LabBridge::new(lab_id, &name, self.settings.vlan_start),
                );
                inner.vlans.insert(
                    lab_id.to_string(),
                    TagAllocator::new(
                        self.settings.vlan_start as u32,
                        self.settings.vlan_end as u32,
                    ),
                );
                name
            }
        };

        inner.state.networks.insert(
            network_id.to_string(),
            NetworkState {
                network_id: network_id.to_string(),
                lab_id: lab_id.to_string(),
                interface_name: interface_name.to_string(),
                bridge_name: bridge_name.clone(),
            },
        );
        if let Some(bridge) = inner.state.lab_bridges.get_mut(lab_id) {
            bridge.network_ids.insert(network_id.to_string());
            bridge.touch();
        }

        self.persist(&mut inner).await;
        info!(network = %short(network_id), lab_id = %lab_id, interface = %interface_name, bridge = %bridge_name, "created network");
        Ok(())
    }

    async fn delete_network(&self, network_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let Some(network) = inner.state.networks.remove(network_id) else {
            return Ok(());
        };
        let lab_id = network.lab_id.clone();
        let mut delete_bridge = None;
        if let Some(bridge) = inner.state.lab_bridges.get_mut(&lab_id) {
            bridge.network_ids.remove(network_id);
            if bridge.network_ids.is_empty() {
                delete_bridge = Some(bridge.bridge_name.clone());
            }
        }

        // Last Docker network gone: the bridge has no reason to live.
        if let Some(bridge_name) = delete_bridge {
            if let Err(err) = self.ovs.delete_bridge(&bridge_name).await {
                error!(bridge = %bridge_name, error = %err, "failed to delete bridge");
            } else {
                info!(bridge = %bridge_name, lab_id = %lab_id, "deleted lab bridge");
            }
            inner.state.lab_bridges.remove(&lab_id);
            inner.vlans.remove(&lab_id);
        }

        self.persist(&mut inner).await;
        info!(network = %short(network_id), "deleted network");
        Ok(())
    }

    async fn create_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let network = inner
            .state
            .networks
            .get(network_id)
            .cloned()
            .ok_or_else(|| anyhow!("network {} not found", short(network_id)))?;

        let vlan_tag = inner
            .vlans
            .get_mut(&network.lab_id)
            .ok_or_else(|| anyhow!("lab bridge for {} not found", network.lab_id))?
            .allocate(endpoint_id)? as u16;

        let (host_veth, cont_veth) = generate_veth_names(endpoint_id);

        if let Err(err) = net::create_veth_pair(&host_veth, &cont_veth).await {
            if let Some(alloc) = inner.vlans.get_mut(&network.lab_id) {
                alloc.release(endpoint_id);
            }
            return Err(err);
        }

        if let Err(err) = self
            .ovs
            .add_port(&network.bridge_name, &host_veth, vlan_tag)
            .await
        {
            let _ = net::delete_link(&host_veth).await;
            if let Some(alloc) = inner.vlans.get_mut(&network.lab_id) {
                alloc.release(endpoint_id);
            }
            return Err(err.into());
        }
        net::set_link_up(&host_veth).await?;

        inner.state.endpoints.insert(
            endpoint_id.to_string(),
            EndpointState {
                endpoint_id: endpoint_id.to_string(),
                network_id: network_id.to_string(),
                interface_name: network.interface_name.clone(),
                host_veth: host_veth.clone(),
                cont_veth: cont_veth.clone(),
                vlan_tag,
                container_name: None,
            },
        );
        if let Some(bridge) = inner.state.lab_bridges.get_mut(&network.lab_id) {
            bridge.touch();
        }
        self.persist(&mut inner).await;

        info!(
            endpoint = %short(endpoint_id),
            host_veth = %host_veth,
            cont_veth = %cont_veth,
            interface = %network.interface_name,
            vlan = vlan_tag,
            "created endpoint"
        );
        Ok(())
    }

    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let Some(ep) = inner.state.endpoints.get(endpoint_id).cloned() else {
            return Ok(());
        };
        let bridge_name = inner
            .state
            .networks
            .get(&ep.network_id)
            .map(|net| net.bridge_name.clone());

        if let Some(bridge_name) = bridge_name {
            let _ = self.ovs.del_port(&bridge_name, &ep.host_veth).await;
        }
        let _ = net::delete_link(&ep.host_veth).await;

        self.forget_endpoint(&mut inner, endpoint_id);
        self.persist(&mut inner).await;
        info!(endpoint = %short(endpoint_id), "deleted endpoint");
        Ok(())
    }

    /// Join tells Docker which interface to move into the sandbox and what to
    /// rename it to. Docker strips trailing digits from DstPrefix targets,
    /// so `eth1` becomes prefix `eth` and Docker appends its own index; the
    /// slot-per-network design makes that index line up with the topology
    /// interface number.
    async fn join(&self, endpoint_id: &str, sandbox_key: &str) -> Result<(String, String)> {
        let inner = self.inner.lock().await;
        let ep = inner
            .state
            .endpoints
            .get(endpoint_id)
            .ok_or_else(|| anyhow!("endpoint {} not found", short(endpoint_id)))?;
        debug!(endpoint = %short(endpoint_id), sandbox = %sandbox_key, "join");
        let prefix = ep
            .interface_name
            .trim_end_matches(|c: char| c.is_ascii_digit())
            .to_string();
        Ok((ep.cont_veth.clone(), prefix))
    }

    pub async fn set_endpoint_container_name(&self, endpoint_id: &str, container_name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(ep) = inner.state.endpoints.get_mut(endpoint_id) {
            ep.container_name = Some(container_name.to_string());
            self.persist(&mut inner).await;
        }
    }

    // =========================================================================
    // Hot connect / disconnect
    // =========================================================================

    /// Resolve `(container, interface)` to the OVS port on the lab's bridge.
    ///
    /// Fast path: the endpoint table. Fallback: enter the container
    /// namespace, follow iflink to the host peer, then verify the port sits
    /// on the expected bridge.
    pub async fn resolve_port(
        &self,
        lab_id: &str,
        container_name: &str,
        interface_name: &str,
    ) -> Result<String> {
        let (bridge_name, tracked_veth) = {
            let inner = self.inner.lock().await;
            let bridge = inner
                .state
                .lab_bridges
                .get(lab_id)
                .ok_or_else(|| anyhow!("lab bridge not found for {lab_id}"))?;
            let tracked = inner
                .state
                .find_endpoint(container_name, interface_name)
                .map(|ep| ep.host_veth.clone());
            (bridge.bridge_name.clone(), tracked)
        };
        if let Some(veth) = tracked_veth {
            return self.verify_port_bridge(&veth, &bridge_name).await;
        }

        let inspect = self
            .docker
            .inspect_container(container_name, None)
            .await
            .with_context(|| format!("container {container_name} not found"))?;
        let pid = inspect
            .state
            .as_ref()
            .and_then(|state| state.pid)
            .filter(|pid| *pid > 0)
            .ok_or_else(|| anyhow!("container {container_name} is not running"))?;

        let port = net::host_peer_of(pid, interface_name).await?;
        self.verify_port_bridge(&port, &bridge_name).await
    }

    async fn verify_port_bridge(&self, port: &str, bridge_name: &str) -> Result<String> {
        match self.ovs.port_to_bridge(port).await? {
            Some(actual) if actual == bridge_name => Ok(port.to_string()),
            Some(actual) => bail!(
                "cross-bridge link rejected: port {port} is on {actual}, expected {bridge_name}"
            ),
            None => bail!("port {port} is not attached to any OVS bridge"),
        }
    }

    /// Make A and B one broadcast domain by giving B's port A's tag.
    /// Already-shared tags make this a no-op. Tags are broadcast domains,
    /// not strict point-to-point links: connecting into an existing group
    /// joins it.
    pub async fn hot_connect(
        &self,
        lab_id: &str,
        container_a: &str,
        iface_a: &str,
        container_b: &str,
        iface_b: &str,
    ) -> Result<u16> {
        let port_a = self.resolve_port(lab_id, container_a, iface_a).await?;
        let port_b = self.resolve_port(lab_id, container_b, iface_b).await?;

        let tag_a = self
            .ovs
            .get_port_tag(&port_a)
            .await?
            .ok_or_else(|| anyhow!("port {port_a} has no VLAN tag"))?;
        let tag_b = self.ovs.get_port_tag(&port_b).await?;

        if tag_b == Some(tag_a) {
            debug!(lab_id = %lab_id, vlan = tag_a, "endpoints already share a tag");
            return Ok(tag_a);
        }

        self.ovs.set_port_tag(&port_b, tag_a).await?;

        let mut inner = self.inner.lock().await;
        let ep_id = inner
            .state
            .endpoints
            .values()
            .find(|ep| ep.host_veth == port_b)
            .map(|ep| ep.endpoint_id.clone());
        if let Some(ep_id) = ep_id {
            if let Some(alloc) = inner.vlans.get_mut(lab_id) {
                alloc.release(&ep_id);
            }
            if let Some(ep) = inner.state.endpoints.get_mut(&ep_id) {
                ep.vlan_tag = tag_a;
            }
        }
        if let Some(bridge) = inner.state.lab_bridges.get_mut(lab_id) {
            bridge.touch();
        }
        self.persist(&mut inner).await;

        info!(
            lab_id = %lab_id,
            a = %format!("{container_a}:{iface_a}"),
            b = %format!("{container_b}:{iface_b}"),
            vlan = tag_a,
            "hot-connected"
        );
        Ok(tag_a)
    }

    /// Isolate one side of a link by moving it to a fresh tag. The other
    /// side keeps its tag.
    pub async fn hot_disconnect(
        &self,
        lab_id: &str,
        container: &str,
        interface: &str,
    ) -> Result<u16> {
        let port = self.resolve_port(lab_id, container, interface).await?;

        let mut inner = self.inner.lock().await;
        let ep_id = inner
            .state
            .endpoints
            .values()
            .find(|ep| ep.host_veth == port)
            .map(|ep| ep.endpoint_id.clone())
            .unwrap_or_else(|| format!("port:{port}"));

        let alloc = inner
            .vlans
            .get_mut(lab_id)
            .ok_or_else(|| anyhow!("lab bridge not found for {lab_id}"))?;
        alloc.release(&ep_id);
        let new_tag = alloc.allocate(&ep_id)? as u16;
        drop(inner);

        self.ovs.set_port_tag(&port, new_tag).await?;

        let mut inner = self.inner.lock().await;
        if let Some(ep) = inner
            .state
            .endpoints
            .values_mut()
            .find(|ep| ep.host_veth == port)
        {
            ep.vlan_tag = new_tag;
        }
        if let Some(bridge) = inner.state.lab_bridges.get_mut(lab_id) {
            bridge.touch();
        }
        self.persist(&mut inner).await;

        info!(lab_id = %lab_id, endpoint = %format!("{container}:{interface}"), vlan = new_tag, "hot-disconnected");
        Ok(new_tag)
    }

    // =========================================================================
    // VXLAN tunnels on the lab bridge (cross-host links)
    // =========================================================================

    /// Idempotent on `(lab_id, vni)`.
    pub async fn create_vxlan_tunnel(
        &self,
        lab_id: &str,
        link_id: &str,
        local_ip: &str,
        remote_ip: &str,
        vni: u32,
        vlan_tag: u16,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let bridge = inner
            .state
            .lab_bridges
            .get(lab_id)
            .ok_or_else(|| anyhow!("lab bridge not found for {lab_id}"))?;

        if let Some(port) = bridge.vxlan_tunnels.get(&vni) {
            return Ok(port.clone());
        }
        let bridge_name = bridge.bridge_name.clone();
        let port = format!("vx{vni}");

        self.ovs.del_port(&bridge_name, &port).await?;
        self.ovs
            .add_vxlan_port(
                &bridge_name,
                &port,
                vni,
                local_ip,
                remote_ip,
                self.settings.vxlan_dst_port,
                Some(vlan_tag),
            )
            .await?;

        if let Some(bridge) = inner.state.lab_bridges.get_mut(lab_id) {
            bridge.vxlan_tunnels.insert(vni, port.clone());
            bridge.touch();
        }
        self.persist(&mut inner).await;

        info!(lab_id = %lab_id, link_id = %link_id, vni, remote = %remote_ip, vlan = vlan_tag, "created VXLAN tunnel port");
        Ok(port)
    }

    pub async fn delete_vxlan_tunnel(&self, lab_id: &str, vni: u32) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(bridge) = inner.state.lab_bridges.get_mut(lab_id) else {
            return Ok(false);
        };
        let Some(port) = bridge.vxlan_tunnels.remove(&vni) else {
            return Ok(false);
        };
        let bridge_name = bridge.bridge_name.clone();
        self.ovs.del_port(&bridge_name, &port).await?;
        self.persist(&mut inner).await;
        info!(lab_id = %lab_id, vni, "deleted VXLAN tunnel port");
        Ok(true)
    }

    // =========================================================================
    // External interfaces
    // =========================================================================

    pub async fn attach_external(
        &self,
        lab_id: &str,
        iface: &str,
        vlan_tag: Option<u16>,
    ) -> Result<u16> {
        let mut inner = self.inner.lock().await;
        let bridge = inner
            .state
            .lab_bridges
            .get(lab_id)
            .ok_or_else(|| anyhow!("lab bridge not found for {lab_id}"))?;

        if let Some(tag) = bridge.external_ports.get(iface) {
            return Ok(*tag);
        }
        if !net::link_exists(iface).await {
            bail!("interface {iface} not found on this host");
        }
        let bridge_name = bridge.bridge_name.clone();

        self.ovs.attach_external(&bridge_name, iface, vlan_tag).await?;
        net::set_link_up(iface).await?;

        let tag = vlan_tag.unwrap_or(0);
        if let Some(bridge) = inner.state.lab_bridges.get_mut(lab_id) {
            bridge.external_ports.insert(iface.to_string(), tag);
            bridge.touch();
        }
        self.persist(&mut inner).await;
        info!(lab_id = %lab_id, iface = %iface, vlan = tag, "attached external interface");
        Ok(tag)
    }

    pub async fn detach_external(&self, lab_id: &str, iface: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(bridge) = inner.state.lab_bridges.get_mut(lab_id) else {
            return Ok(false);
        };
        if bridge.external_ports.remove(iface).is_none() {
            return Ok(false);
        }
        let bridge_name = bridge.bridge_name.clone();
        self.ovs.del_port(&bridge_name, iface).await?;
        self.persist(&mut inner).await;
        Ok(true)
    }

    /// Pull a container NIC onto the VLAN of an already attached external
    /// interface.
    pub async fn connect_to_external(
        &self,
        lab_id: &str,
        container_name: &str,
        interface_name: &str,
        external_iface: &str,
    ) -> Result<u16> {
        let tag = {
            let inner = self.inner.lock().await;
            let bridge = inner
                .state
                .lab_bridges
                .get(lab_id)
                .ok_or_else(|| anyhow!("lab bridge not found for {lab_id}"))?;
            *bridge
                .external_ports
                .get(external_iface)
                .ok_or_else(|| anyhow!("external interface {external_iface} not attached"))?
        };

        let port = self.resolve_port(lab_id, container_name, interface_name).await?;
        self.ovs.set_port_tag(&port, tag).await?;

        let mut inner = self.inner.lock().await;
        if let Some(ep) = inner
            .state
            .endpoints
            .values_mut()
            .find(|ep| ep.host_veth == port)
        {
            ep.vlan_tag = tag;
        }
        self.persist(&mut inner).await;
        info!(lab_id = %lab_id, container = %container_name, iface = %interface_name, external = %external_iface, vlan = tag, "connected to external network");
        Ok(tag)
    }

    pub async fn list_external(&self, lab_id: &str) -> Vec<(String, u16)> {
        let inner = self.inner.lock().await;
        inner
            .state
            .lab_bridges
            .get(lab_id)
            .map(|bridge| {
                bridge
                    .external_ports
                    .iter()
                    .map(|(iface, tag)| (iface.clone(), *tag))
                    .collect()
            })
            .unwrap_or_default()
    }

    // =========================================================================
    // Management network (eth0 with NAT)
    // =========================================================================

    pub async fn create_management_network(&self, lab_id: &str) -> Result<ManagementNetwork> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.state.management_networks.get(lab_id) {
            return Ok(existing.clone());
        }

        let network_name = mgmt_network_name(lab_id);
        let (subnet, gateway) = next_mgmt_subnet(
            &self.settings.mgmt_subnet_base,
            &mut inner.state.next_mgmt_subnet_index,
        )?;

        let network_id = match self
            .docker
            .inspect_network::<String>(&network_name, None)
            .await
        {
            Ok(existing) => existing.id.unwrap_or_default(),
            Err(_) => {
                let options = CreateNetworkOptions {
                    name: network_name.clone(),
                    driver: "bridge".to_string(),
                    ipam: bollard::models::Ipam {
                        config: Some(vec![bollard::models::IpamConfig {
                            subnet: Some(subnet.clone()),
                            gateway: Some(gateway.clone()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    },
                    options: HashMap::from([(
                        "com.docker.network.bridge.enable_ip_masquerade".to_string(),
                        self.settings.mgmt_enable_nat.to_string(),
                    )]),
                    labels: HashMap::from([
                        (LABEL_LAB_ID.to_string(), lab_id.to_string()),
                        (LABEL_TYPE.to_string(), "management".to_string()),
                    ]),
                    ..Default::default()
                };
                let created = self.docker.create_network(options).await?;
                created.id.unwrap_or_default()
            }
        };

        let mgmt = ManagementNetwork {
            lab_id: lab_id.to_string(),
            network_id,
            network_name,
            subnet,
            gateway,
        };
        inner
            .state
            .management_networks
            .insert(lab_id.to_string(), mgmt.clone());
        self.persist(&mut inner).await;
        info!(lab_id = %lab_id, network = %mgmt.network_name, subnet = %mgmt.subnet, "created management network");
        Ok(mgmt)
    }

    pub async fn delete_management_network(&self, lab_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(mgmt) = inner.state.management_networks.remove(lab_id) else {
            return Ok(false);
        };

        match self.docker.remove_network(&mgmt.network_name).await {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(err) if err.to_string().contains("has active endpoints") => {
                // Force-disconnect stragglers, then retry once.
                if let Ok(info) = self
                    .docker
                    .inspect_network::<String>(&mgmt.network_name, None)
                    .await
                {
                    for container_id in info.containers.unwrap_or_default().keys() {
                        let _ = self
                            .docker
                            .disconnect_network(
                                &mgmt.network_name,
                                DisconnectNetworkOptions {
                                    container: container_id.clone(),
                                    force: true,
                                },
                            )
                            .await;
                    }
                }
                if let Err(err) = self.docker.remove_network(&mgmt.network_name).await {
                    error!(network = %mgmt.network_name, error = %err, "failed to delete management network");
                    inner.state.management_networks.insert(lab_id.to_string(), mgmt);
                    return Ok(false);
                }
            }
            Err(err) => {
                error!(network = %mgmt.network_name, error = %err, "failed to delete management network");
                inner.state.management_networks.insert(lab_id.to_string(), mgmt);
                return Ok(false);
            }
        }

        self.persist(&mut inner).await;
        Ok(true)
    }

    pub async fn attach_to_management(&self, container: &str, lab_id: &str) -> Result<Option<String>> {
        let mgmt = self.create_management_network(lab_id).await?;

        self.docker
            .connect_network(
                &mgmt.network_name,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: Default::default(),
                },
            )
            .await
            .or_else(|err| {
                if err.to_string().contains("already exists") {
                    Ok(())
                } else {
                    Err(err)
                }
            })?;

        let inspect = self.docker.inspect_container(container, None).await?;
        let ip = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| networks.get(&mgmt.network_name).cloned())
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty());
        Ok(ip)
    }

    // =========================================================================
    // Lab cleanup & TTL
    // =========================================================================

    /// Tear down everything the plugin tracks for a lab: tunnels, external
    /// ports, endpoints, networks, the bridge, the management network.
    pub async fn cleanup_lab(&self, lab_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if let Some(bridge) = inner.state.lab_bridges.get(lab_id).cloned() {
            for port in bridge.vxlan_tunnels.values() {
                let _ = self.ovs.del_port(&bridge.bridge_name, port).await;
            }
            for iface in bridge.external_ports.keys() {
                let _ = self.ovs.del_port(&bridge.bridge_name, iface).await;
            }

            let endpoint_ids: Vec<String> = inner
                .state
                .endpoints_for_lab(lab_id)
                .map(|ep| ep.endpoint_id.clone())
                .collect();
            for ep_id in endpoint_ids {
                if let Some(ep) = inner.state.endpoints.get(&ep_id).cloned() {
                    let _ = self.ovs.del_port(&bridge.bridge_name, &ep.host_veth).await;
                    let _ = net::delete_link(&ep.host_veth).await;
                }
                self.forget_endpoint(&mut inner, &ep_id);
            }

            inner
                .state
                .networks
                .retain(|_, network| network.lab_id != lab_id);

            let _ = self.ovs.delete_bridge(&bridge.bridge_name).await;
            inner.state.lab_bridges.remove(lab_id);
            inner.vlans.remove(lab_id);
        }

        let has_mgmt = inner.state.management_networks.contains_key(lab_id);
        self.persist(&mut inner).await;
        drop(inner);

        if has_mgmt {
            let _ = self.delete_management_network(lab_id).await;
        }

        info!(lab_id = %lab_id, "cleaned up plugin resources");
        Ok(())
    }

    /// Background sweep for labs whose bridges saw no activity past the TTL.
    pub fn spawn_ttl_cleanup(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if !self.settings.lab_ttl_enabled {
            return None;
        }
        let plugin = Arc::clone(self);
        info!(
            ttl_secs = plugin.settings.lab_ttl.as_secs(),
            interval_secs = plugin.settings.lab_ttl_check_interval.as_secs(),
            "lab TTL cleanup enabled"
        );
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(plugin.settings.lab_ttl_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired: Vec<String> = {
                    let inner = plugin.inner.lock().await;
                    let ttl = chrono::Duration::from_std(plugin.settings.lab_ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(86_400));
                    inner
                        .state
                        .lab_bridges
                        .values()
                        .filter(|bridge| Utc::now() - bridge.last_activity > ttl)
                        .map(|bridge| bridge.lab_id.clone())
                        .collect()
                };
                for lab_id in expired {
                    info!(lab_id = %lab_id, "lab exceeded idle TTL, cleaning up");
                    if let Err(err) = plugin.cleanup_lab(&lab_id).await {
                        error!(lab_id = %lab_id, error = %err, "TTL cleanup failed");
                    }
                }
            }
        }))
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn lab_status(&self, lab_id: &str) -> Option<serde_json::Value> {
        let inner = self.inner.lock().await;
        let bridge = inner.state.lab_bridges.get(lab_id)?;

        let endpoints: Vec<_> = inner
            .state
            .endpoints_for_lab(lab_id)
            .map(|ep| {
                json!({
                    "endpoint_id": short(&ep.endpoint_id),
                    "container": ep.container_name,
                    "interface": ep.interface_name,
                    "host_veth": ep.host_veth,
                    "vlan": ep.vlan_tag,
                })
            })
            .collect();

        Some(json!({
            "lab_id": lab_id,
            "bridge_name": bridge.bridge_name,
            "networks": bridge.network_ids.len(),
            "vxlan_tunnels": bridge.vxlan_tunnels.len(),
            "external_interfaces": bridge.external_ports.keys().collect::<Vec<_>>(),
            "endpoints": endpoints,
        }))
    }

    pub async fn status(&self) -> serde_json::Value {
        let inner = self.inner.lock().await;
        json!({
            "healthy": self.ovs.available().await,
            "labs_count": inner.state.lab_bridges.len(),
            "networks_count": inner.state.networks.len(),
            "endpoints_count": inner.state.endpoints.len(),
            "management_networks_count": inner.state.management_networks.len(),
            "uptime_seconds": (Utc::now() - self.started_at).num_seconds(),
            "state_file": self.store.path().display().to_string(),
        })
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

pub fn mgmt_network_name(lab_id: &str) -> String {
    format!("trellis-mgmt-{}", &lab_id[..lab_id.len().min(20)])
}

/// Veth names stay under the 15-char interface limit:
/// `vh` + 5 chars of endpoint id + 6 random hex chars.
pub fn generate_veth_names(endpoint_id: &str) -> (String, String) {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    let id_part = &endpoint_id[..endpoint_id.len().min(5)];
    (
        format!("vh{id_part}{suffix:06x}"),
        format!("vc{id_part}{suffix:06x}"),
    )
}

/// Carve the next /24 out of the configured /16 base.
pub fn next_mgmt_subnet(base: &str, index: &mut u8) -> Result<(String, String)> {
    let network = base
        .split('/')
        .next()
        .ok_or_else(|| anyhow!("invalid management subnet base {base}"))?;
    let octets: Vec<&str> = network.split('.').collect();
    if octets.len() != 4 {
        bail!("invalid management subnet base {base}");
    }
    let (a, b) = (octets[0], octets[1]);
    let slot = *index;
    *index = if *index >= 255 { 1 } else { *index + 1 };
    Ok((format!("{a}.{b}.{slot}.0/24"), format!("{a}.{b}.{slot}.1")))
}

// =============================================================================
// Docker remote network-driver HTTP contract
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateNetworkBody {
    #[serde(rename = "NetworkID")]
    network_id: String,
    #[serde(rename = "Options", default)]
    options: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct NetworkIdBody {
    #[serde(rename = "NetworkID")]
    network_id: String,
}

#[derive(Debug, Deserialize)]
struct EndpointBody {
    #[serde(rename = "NetworkID", default)]
    network_id: String,
    #[serde(rename = "EndpointID")]
    endpoint_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinBody {
    #[serde(rename = "EndpointID")]
    endpoint_id: String,
    #[serde(rename = "SandboxKey", default)]
    sandbox_key: String,
}

fn driver_err(message: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(json!({ "Err": message.to_string() }))
}

pub fn driver_router(plugin: Arc<DockerOvsPlugin>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(get_capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(empty_ok))
        .route("/NetworkDriver.DiscoverNew", post(empty_ok))
        .route("/NetworkDriver.DiscoverDelete", post(empty_ok))
        .route("/NetworkDriver.ProgramExternalConnectivity", post(empty_ok))
        .route("/NetworkDriver.RevokeExternalConnectivity", post(empty_ok))
        .layer(Extension(plugin))
}

async fn activate() -> Json<serde_json::Value> {
    Json(json!({ "Implements": ["NetworkDriver"] }))
}

async fn get_capabilities() -> Json<serde_json::Value> {
    Json(json!({ "Scope": "local", "ConnectivityScope": "local" }))
}

async fn empty_ok() -> Json<serde_json::Value> {
    Json(json!({}))
}

async fn create_network(
    Extension(plugin): Extension<Arc<DockerOvsPlugin>>,
    Json(body): Json<CreateNetworkBody>,
) -> Json<serde_json::Value> {
    let generic = &body.options["com.docker.network.generic"];
    let lab_id = generic["lab_id"].as_str().unwrap_or_default();
    let interface_name = generic["interface_name"].as_str().unwrap_or("eth1");

    if lab_id.is_empty() {
        return driver_err("lab_id option is required");
    }

    match plugin
        .create_network(&body.network_id, lab_id, interface_name)
        .await
    {
        Ok(()) => Json(json!({})),
        Err(err) => driver_err(err),
    }
}

async fn delete_network(
    Extension(plugin): Extension<Arc<DockerOvsPlugin>>,
    Json(body): Json<NetworkIdBody>,
) -> Json<serde_json::Value> {
    match plugin.delete_network(&body.network_id).await {
        Ok(()) => Json(json!({})),
        Err(err) => driver_err(err),
    }
}

async fn create_endpoint(
    Extension(plugin): Extension<Arc<DockerOvsPlugin>>,
    Json(body): Json<EndpointBody>,
) -> Json<serde_json::Value> {
    match plugin
        .create_endpoint(&body.network_id, &body.endpoint_id)
        .await
    {
        Ok(()) => Json(json!({ "Interface": {} })),
        Err(err) => driver_err(err),
    }
}

async fn delete_endpoint(
    Extension(plugin): Extension<Arc<DockerOvsPlugin>>,
    Json(body): Json<EndpointBody>,
) -> Json<serde_json::Value> {
    match plugin.delete_endpoint(&body.endpoint_id).await {
        Ok(()) => Json(json!({})),
        Err(err) => driver_err(err),
    }
}

async fn join(
    Extension(plugin): Extension<Arc<DockerOvsPlugin>>,
    Json(body): Json<JoinBody>,
) -> Json<serde_json::Value> {
    match plugin.join(&body.endpoint_id, &body.sandbox_key).await {
        Ok((src_name, dst_prefix)) => Json(json!({
            "InterfaceName": {
                "SrcName": src_name,
                "DstPrefix": dst_prefix,
            },
        })),
        Err(err) => driver_err(err),
    }
}

/// Serve the driver contract on the plugin unix socket and write the spec
/// file Docker uses for discovery.
pub async fn serve_plugin(
    plugin: Arc<DockerOvsPlugin>,
    socket_path: &Path,
    spec_path: &Path,
) -> Result<tokio::task::JoinHandle<()>> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // A stale socket from a previous run blocks bind.
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding plugin socket {}", socket_path.display()))?;

    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o755)).await?;

    if let Some(parent) = spec_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(spec_path, format!("unix://{}\n", socket_path.display())).await?;

    info!(socket = %socket_path.display(), "docker network plugin listening");

    let router = driver_router(plugin);
    let handle = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "plugin socket accept failed");
                    continue;
                }
            };
            let service = TowerToHyperService::new(router.clone());
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    debug!(error = %err, "plugin connection error");
                }
            });
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn test_settings() -> PluginSettings {
        PluginSettings {
            vlan_start: 100,
            vlan_end: 4000,
            vxlan_dst_port: 4789,
            mgmt_subnet_base: "172.20.0.0/16".to_string(),
            mgmt_enable_nat: true,
            lab_ttl_enabled: false,
            lab_ttl: std::time::Duration::from_secs(86_400),
            lab_ttl_check_interval: std::time::Duration::from_secs(3_600),
        }
    }

    fn test_router() -> Router {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let plugin = Arc::new(DockerOvsPlugin::new(test_settings(), docker, dir.path()));
        driver_router(plugin)
    }

    async fn post_driver(router: Router, path: &str, body: &str) -> serde_json::Value {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn activate_declares_network_driver() {
        let body = post_driver(test_router(), "/Plugin.Activate", "{}").await;
        assert_eq!(body["Implements"][0], "NetworkDriver");
    }

    #[tokio::test]
    async fn capabilities_are_local_scope() {
        let body = post_driver(test_router(), "/NetworkDriver.GetCapabilities", "{}").await;
        assert_eq!(body["Scope"], "local");
        assert_eq!(body["ConnectivityScope"], "local");
    }

    #[tokio::test]
    async fn create_network_without_lab_id_is_a_driver_error() {
        let body = post_driver(
            test_router(),
            "/NetworkDriver.CreateNetwork",
            r#"{"NetworkID": "abc123", "Options": {}}"#,
        )
        .await;
        assert_eq!(body["Err"], "lab_id option is required");
    }

    #[tokio::test]
    async fn join_unknown_endpoint_is_a_driver_error() {
        let body = post_driver(
            test_router(),
            "/NetworkDriver.Join",
            r#"{"EndpointID": "nope", "SandboxKey": "/var/run/docker/netns/x"}"#,
        )
        .await;
        assert!(body["Err"].as_str().unwrap().contains("not found"));
    }

    #[test]
    fn veth_names_fit_interface_limit() {
        let (host, cont) = generate_veth_names("0a1b2c3d4e5f6789");
        assert!(host.len() <= 15, "{host} too long");
        assert!(cont.len() <= 15, "{cont} too long");
        assert!(host.starts_with("vh"));
        assert!(cont.starts_with("vc"));
        assert_eq!(&host[2..], &cont[2..]);
    }

    #[test]
    fn veth_names_vary_between_calls() {
        let (a, _) = generate_veth_names("0a1b2c3d4e5f6789");
        let (b, _) = generate_veth_names("0a1b2c3d4e5f6789");
        // Random suffix keeps regenerated pairs from colliding with leftovers.
        assert_ne!(a, b);
    }

    #[test]
    fn mgmt_subnets_advance_and_wrap() {
        let mut index = 254;
        let (subnet, gateway) = next_mgmt_subnet("172.20.0.0/16", &mut index).unwrap();
        assert_eq!(subnet, "172.20.254.0/24");
        assert_eq!(gateway, "172.20.254.1");
        assert_eq!(index, 255);

        let (subnet, _) = next_mgmt_subnet("172.20.0.0/16", &mut index).unwrap();
        assert_eq!(subnet, "172.20.255.0/24");
        assert_eq!(index, 1);
    }

    #[test]
    fn mgmt_subnet_rejects_garbage_base() {
        let mut index = 1;
        assert!(next_mgmt_subnet("not-a-subnet", &mut index).is_err());
    }

    #[test]
    fn mgmt_network_name_truncates_long_lab_ids() {
        let name = mgmt_network_name("0123456789012345678901234567890");
        assert_eq!(name, "trellis-mgmt-01234567890123456789");
    }
}
