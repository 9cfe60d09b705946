//! VXLAN overlays for cross-host links.
//!
//! Each cross-host link owns one VNI. The local side is a VXLAN interface
//! pinned to the remote agent plus a helper Linux bridge `abr-<vni>`; the
//! endpoint container is attached to that bridge with a veth pair whose
//! container end is renamed to the topology interface. This path coexists
//! with the plugin's lab-bridge VXLAN ports; the two draw from disjoint VNI
//! ranges.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use bollard::Docker;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::net;
use crate::network::allocator::TagAllocator;
use trellis_types::{OverlayBridgeInfo, TunnelInfo};

pub const VXLAN_DST_PORT: u16 = 4789;

#[derive(Debug, Clone)]
pub struct VxlanTunnel {
    pub vni: u32,
    pub local_ip: String,
    pub remote_ip: String,
    pub interface_name: String,
    pub lab_id: String,
    pub link_id: String,
}

#[derive(Debug, Clone)]
pub struct OverlayBridge {
    pub name: String,
    pub vni: u32,
    pub lab_id: String,
    pub link_id: String,
    /// (host_end, container_interface) pairs attached to this bridge.
    pub veth_pairs: Vec<(String, String)>,
}

struct OverlayInner {
    tunnels: HashMap<String, VxlanTunnel>,
    bridges: HashMap<String, OverlayBridge>,
    vnis: TagAllocator,
}

pub struct OverlayManager {
    docker: Docker,
    inner: Mutex<OverlayInner>,
}

fn key(lab_id: &str, link_id: &str) -> String {
    format!("{lab_id}:{link_id}")
}

impl OverlayManager {
    pub fn new(docker: Docker, vni_base: u32, vni_max: u32) -> Self {
        Self {
            docker,
            inner: Mutex::new(OverlayInner {
                tunnels: HashMap::new(),
                bridges: HashMap::new(),
                vnis: TagAllocator::new(vni_base, vni_max),
            }),
        }
    }

    /// Create the VXLAN interface for a link and its helper bridge.
    /// Idempotent per `(lab_id, link_id)`; the first side allocates the VNI,
    /// the second side passes it in so both ends match.
    pub async fn create_tunnel(
        &self,
        lab_id: &str,
        link_id: &str,
        local_ip: &str,
        remote_ip: &str,
        vni: Option<u32>,
    ) -> Result<VxlanTunnel> {
        let key = key(lab_id, link_id);

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.tunnels.get(&key) {
            return Ok(existing.clone());
        }

        let vni = match vni {
            Some(vni) => {
                inner.vnis.adopt(&key, vni);
                vni
            }
            None => inner.vnis.allocate(&key)?,
        };
        let interface_name = format!("vxlan{vni}");

        // A leftover interface from a previous run carries stale endpoints.
        if net::link_exists(&interface_name).await {
            warn!(iface = %interface_name, "VXLAN interface already exists, recreating");
            let _ = net::delete_link(&interface_name).await;
        }

        if let Err(err) =
            net::create_vxlan_iface(&interface_name, vni, local_ip, remote_ip, VXLAN_DST_PORT).await
        {
            inner.vnis.release(&key);
            return Err(err);
        }
        if let Err(err) = net::set_link_up(&interface_name).await {
            let _ = net::delete_link(&interface_name).await;
            inner.vnis.release(&key);
            return Err(err);
        }

        let tunnel = VxlanTunnel {
            vni,
            local_ip: local_ip.to_string(),
            remote_ip: remote_ip.to_string(),
            interface_name: interface_name.clone(),
            lab_id: lab_id.to_string(),
            link_id: link_id.to_string(),
        };
        inner.tunnels.insert(key, tunnel.clone());
        info!(iface = %interface_name, vni, remote = %remote_ip, "created VXLAN tunnel");
        Ok(tunnel)
    }

    /// Create the helper bridge for a tunnel and enslave the VXLAN interface.
    pub async fn create_bridge(&self, tunnel: &VxlanTunnel) -> Result<OverlayBridge> {
        let key = key(&tunnel.lab_id, &tunnel.link_id);

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.bridges.get(&key) {
            return Ok(existing.clone());
        }

        let bridge_name = format!("abr-{}", tunnel.vni);
        if net::link_exists(&bridge_name).await {
            warn!(bridge = %bridge_name, "overlay bridge already exists, recreating");
            let _ = net::delete_link(&bridge_name).await;
        }

        net::create_linux_bridge(&bridge_name).await?;
        if let Err(err) = net::set_link_master(&tunnel.interface_name, &bridge_name).await {
            let _ = net::delete_link(&bridge_name).await;
            return Err(err);
        }

        let bridge = OverlayBridge {
            name: bridge_name.clone(),
            vni: tunnel.vni,
            lab_id: tunnel.lab_id.clone(),
            link_id: tunnel.link_id.clone(),
            veth_pairs: Vec::new(),
        };
        inner.bridges.insert(key, bridge.clone());
        info!(bridge = %bridge_name, vxlan = %tunnel.interface_name, "created overlay bridge");
        Ok(bridge)
    }

    /// Attach a container interface to the overlay bridge for a link. The
    /// optional `ip_address` (CIDR) is configured inside the namespace after
    /// the attach; failure to set it is a warning, not an error.
    pub async fn attach_container(
        &self,
        lab_id: &str,
        link_id: &str,
        container_name: &str,
        interface_name: &str,
        ip_address: Option<&str>,
    ) -> Result<()> {
        let key = key(lab_id, link_id);
        let (bridge_name, vni) = {
            let inner = self.inner.lock().await;
            let bridge = inner
                .bridges
                .get(&key)
                .ok_or_else(|| anyhow!("no overlay bridge for link {link_id}"))?;
            (bridge.name.clone(), bridge.vni)
        };

        let inspect = self.docker.inspect_container(container_name, None).await?;
        let running = inspect
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        let pid = inspect.state.as_ref().and_then(|state| state.pid).unwrap_or(0);
        if !running || pid <= 0 {
            bail!("container {container_name} is not running");
        }

        let suffix: u16 = rand::random();
        let veth_host = truncate_ifname(&format!("v{}{suffix:04x}h", vni % 10_000));
        let veth_cont = truncate_ifname(&format!("v{}{suffix:04x}c", vni % 10_000));

        let _ = net::delete_link(&veth_host).await;
        net::create_veth_pair(&veth_host, &veth_cont).await?;

        if let Err(err) = net::set_link_master(&veth_host, &bridge_name).await {
            let _ = net::delete_link(&veth_host).await;
            return Err(err);
        }
        net::set_link_up(&veth_host).await?;

        if let Err(err) = net::move_to_netns(&veth_cont, pid).await {
            let _ = net::delete_link(&veth_host).await;
            return Err(err);
        }

        // Devices that pre-create placeholder interfaces need the name freed.
        let _ = net::ip_in_netns(pid, &["link", "delete", interface_name]).await;
        net::rename_in_netns(pid, &veth_cont, interface_name).await?;

        if let Some(cidr) = ip_address {
            if let Err(err) = net::add_addr_in_netns(pid, interface_name, cidr).await {
                warn!(container = %container_name, iface = %interface_name, cidr = %cidr, error = %err, "failed to configure link address");
            }
        }

        let mut inner = self.inner.lock().await;
        if let Some(bridge) = inner.bridges.get_mut(&key) {
            bridge
                .veth_pairs
                .push((veth_host.clone(), interface_name.to_string()));
        }
        info!(container = %container_name, iface = %interface_name, bridge = %bridge_name, "attached container to overlay");
        Ok(())
    }

    /// Tear down every bridge, then every tunnel, for a lab. VNIs are
    /// released so the same `(lab_id, link_id)` can be re-established later.
    pub async fn cleanup_lab(&self, lab_id: &str) -> (u32, u32, Vec<String>) {
        let mut inner = self.inner.lock().await;
        let mut errors = Vec::new();

        let bridge_keys: Vec<String> = inner
            .bridges
            .values()
            .filter(|bridge| bridge.lab_id == lab_id)
            .map(|bridge| key(&bridge.lab_id, &bridge.link_id))
            .collect();
        let mut bridges_deleted = 0;
        for bridge_key in bridge_keys {
            if let Some(bridge) = inner.bridges.remove(&bridge_key) {
                for (host_end, _) in &bridge.veth_pairs {
                    if let Err(err) = net::delete_link(host_end).await {
                        errors.push(format!("veth {host_end}: {err}"));
                    }
                }
                if let Err(err) = net::delete_link(&bridge.name).await {
                    errors.push(format!("bridge {}: {err}", bridge.name));
                } else {
                    bridges_deleted += 1;
                }
            }
        }

        let tunnel_keys: Vec<String> = inner
            .tunnels
            .values()
            .filter(|tunnel| tunnel.lab_id == lab_id)
            .map(|tunnel| key(&tunnel.lab_id, &tunnel.link_id))
            .collect();
        let mut tunnels_deleted = 0;
        for tunnel_key in tunnel_keys {
            if let Some(tunnel) = inner.tunnels.remove(&tunnel_key) {
                if let Err(err) = net::delete_link(&tunnel.interface_name).await {
                    errors.push(format!("tunnel {}: {err}", tunnel.interface_name));
                } else {
                    tunnels_deleted += 1;
                }
                inner.vnis.release(&tunnel_key);
            }
        }

        info!(
            lab_id = %lab_id,
            tunnels = tunnels_deleted,
            bridges = bridges_deleted,
            errors = errors.len(),
            "overlay cleanup"
        );
        (tunnels_deleted, bridges_deleted, errors)
    }

    pub async fn status(&self) -> (Vec<TunnelInfo>, Vec<OverlayBridgeInfo>) {
        let inner = self.inner.lock().await;
        let tunnels = inner
            .tunnels
            .values()
            .map(|tunnel| TunnelInfo {
                vni: tunnel.vni,
                interface_name: tunnel.interface_name.clone(),
                local_ip: tunnel.local_ip.clone(),
                remote_ip: tunnel.remote_ip.clone(),
                lab_id: tunnel.lab_id.clone(),
                link_id: tunnel.link_id.clone(),
            })
            .collect();
        let bridges = inner
            .bridges
            .values()
            .map(|bridge| OverlayBridgeInfo {
                name: bridge.name.clone(),
                vni: bridge.vni,
                lab_id: bridge.lab_id.clone(),
                link_id: bridge.link_id.clone(),
            })
            .collect();
        (tunnels, bridges)
    }
}

/// Interface names are capped at 15 bytes.
fn truncate_ifname(name: &str) -> String {
    name.chars().take(15).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_veth_names_fit_limit() {
        let name = truncate_ifname(&format!("v{}{:04x}h", 199_999 % 10_000, 0xffffu16));
        assert!(name.len() <= 15);
    }

    #[test]
    fn keys_are_scoped_by_lab() {
        assert_ne!(key("lab1", "r1:eth1-r2:eth1"), key("lab2", "r1:eth1-r2:eth1"));
    }
}
