//! Typed wrapper over `ovs-vsctl` / `ovs-ofctl`.
//!
//! Link isolation model: every lab gets one OVS bridge in fail-mode `secure`
//! with a single `priority=1,actions=normal` flow. Traffic is then switched
//! only between ports carrying the same VLAN access tag, so two container
//! interfaces are connected iff their host-side veth ports share a tag.

use std::time::Duration;

use crate::core::cmd::{self, CmdError};

pub const BRIDGE_PREFIX: &str = "ovs-";

#[derive(Debug, thiserror::Error)]
pub enum OvsError {
    #[error("`{cmd}` failed: {stderr}")]
    Command { cmd: String, stderr: String },
    #[error(transparent)]
    Exec(#[from] CmdError),
}

/// Bridge name for a lab: `ovs-` + first 12 chars of the lab id.
///
/// Linux caps interface names at 15 bytes (IFNAMSIZ minus the NUL).
pub fn bridge_name(lab_id: &str) -> String {
    let prefix_len = lab_id.len().min(12);
    format!("{BRIDGE_PREFIX}{}", &lab_id[..prefix_len])
}

#[derive(Debug, Clone)]
pub struct OvsFabric {
    timeout: Duration,
}

impl Default for OvsFabric {
    fn default() -> Self {
        Self::new(cmd::DEFAULT_CMD_TIMEOUT)
    }
}

impl OvsFabric {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn vsctl(&self, args: &[&str]) -> Result<cmd::CmdOutput, OvsError> {
        Ok(cmd::run_with_timeout("ovs-vsctl", args, self.timeout).await?)
    }

    async fn vsctl_ok(&self, args: &[&str]) -> Result<String, OvsError> {
        let out = self.vsctl(args).await?;
        if !out.success() {
            return Err(OvsError::Command {
                cmd: cmd::render("ovs-vsctl", args),
                stderr: out.stderr_trimmed().to_string(),
            });
        }
        Ok(out.stdout)
    }

    pub async fn available(&self) -> bool {
        matches!(self.vsctl(&["--version"]).await, Ok(out) if out.success())
    }

    pub async fn bridge_exists(&self, bridge: &str) -> Result<bool, OvsError> {
        Ok(self.vsctl(&["br-exists", bridge]).await?.success())
    }

    /// Create the lab bridge if absent: fail-mode secure, normal-action flow,
    /// link up. Idempotent.
    pub async fn ensure_bridge(&self, bridge: &str) -> Result<(), OvsError> {
        if self.bridge_exists(bridge).await? {
            return Ok(());
        }
        self.vsctl_ok(&["add-br", bridge]).await?;
        self.vsctl_ok(&["set-fail-mode", bridge, "secure"]).await?;

        let flow = cmd::run_with_timeout(
            "ovs-ofctl",
            &["add-flow", bridge, "priority=1,actions=normal"],
            self.timeout,
        )
        .await?;
        if !flow.success() {
            return Err(OvsError::Command {
                cmd: format!("ovs-ofctl add-flow {bridge} priority=1,actions=normal"),
                stderr: flow.stderr_trimmed().to_string(),
            });
        }

        let up = cmd::run_with_timeout("ip", &["link", "set", bridge, "up"], self.timeout).await?;
        if !up.success() {
            return Err(OvsError::Command {
                cmd: format!("ip link set {bridge} up"),
                stderr: up.stderr_trimmed().to_string(),
            });
        }
        Ok(())
    }

    pub async fn delete_bridge(&self, bridge: &str) -> Result<(), OvsError> {
        self.vsctl_ok(&["--if-exists", "del-br", bridge]).await?;
        Ok(())
    }

    pub async fn list_bridges(&self) -> Result<Vec<String>, OvsError> {
        let out = self.vsctl_ok(&["list-br"]).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    pub async fn list_ports(&self, bridge: &str) -> Result<Vec<String>, OvsError> {
        let out = self.vsctl_ok(&["list-ports", bridge]).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Add a veth (type system) as an access port with the given VLAN tag.
    pub async fn add_port(&self, bridge: &str, port: &str, tag: u16) -> Result<(), OvsError> {
        let tag_arg = format!("tag={tag}");
        self.vsctl_ok(&[
            "add-port", bridge, port, &tag_arg, "--", "set", "interface", port, "type=system",
        ])
        .await?;
        Ok(())
    }

    pub async fn set_port_tag(&self, port: &str, tag: u16) -> Result<(), OvsError> {
        let tag_arg = format!("tag={tag}");
        self.vsctl_ok(&["set", "port", port, &tag_arg]).await?;
        Ok(())
    }

    /// Read a port's VLAN access tag. `None` when the port is untagged
    /// (ovs-vsctl prints `[]`).
    pub async fn get_port_tag(&self, port: &str) -> Result<Option<u16>, OvsError> {
        let out = self.vsctl_ok(&["get", "port", port, "tag"]).await?;
        Ok(parse_tag(&out))
    }

    /// Remove an OVS port. `--if-exists` makes this idempotent; the caller is
    /// responsible for deleting the underlying veth afterwards.
    pub async fn del_port(&self, bridge: &str, port: &str) -> Result<(), OvsError> {
        self.vsctl_ok(&["--if-exists", "del-port", bridge, port]).await?;
        Ok(())
    }

    /// Create a VXLAN interface port pinned to `remote_ip`.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_vxlan_port(
        &self,
        bridge: &str,
        port: &str,
        vni: u32,
        local_ip: &str,
        remote_ip: &str,
        dst_port: u16,
        tag: Option<u16>,
    ) -> Result<(), OvsError> {
        let options = format!(
            "options:remote_ip={remote_ip},options:local_ip={local_ip},options:key={vni},options:dst_port={dst_port}"
        );
        match tag {
            Some(tag) => {
                let tag_arg = format!("tag={tag}");
                self.vsctl_ok(&[
                    "add-port", bridge, port, &tag_arg, "--", "set", "interface", port,
                    "type=vxlan", &options,
                ])
                .await?;
            }
            None => {
                self.vsctl_ok(&[
                    "add-port", bridge, port, "--", "set", "interface", port, "type=vxlan",
                    &options,
                ])
                .await?;
            }
        }
        Ok(())
    }

    /// Attach an existing host interface: access mode when a tag is given,
    /// trunk otherwise.
    pub async fn attach_external(
        &self,
        bridge: &str,
        iface: &str,
        tag: Option<u16>,
    ) -> Result<(), OvsError> {
        match tag {
            Some(tag) => {
                let tag_arg = format!("tag={tag}");
                self.vsctl_ok(&["add-port", bridge, iface, &tag_arg]).await?;
            }
            None => {
                self.vsctl_ok(&["add-port", bridge, iface]).await?;
            }
        }
        Ok(())
    }

    /// Which bridge a port belongs to, or `None` if it is on no bridge.
    pub async fn port_to_bridge(&self, port: &str) -> Result<Option<String>, OvsError> {
        let out = self.vsctl(&["port-to-br", port]).await?;
        if out.success() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Interface type (`system`, `vxlan`, `internal`, ...).
    pub async fn interface_type(&self, iface: &str) -> Result<String, OvsError> {
        let out = self.vsctl_ok(&["get", "interface", iface, "type"]).await?;
        Ok(out.trim().trim_matches('"').to_string())
    }

    /// VNI (`options:key`) of a VXLAN interface, if set.
    pub async fn interface_vni(&self, iface: &str) -> Result<Option<u32>, OvsError> {
        let out = self.vsctl(&["get", "interface", iface, "options:key"]).await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out.stdout.trim().trim_matches('"').parse().ok())
    }
}

fn parse_tag(raw: &str) -> Option<u16> {
    let trimmed = raw.trim().trim_matches(|c| c == '[' || c == ']');
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_name_truncates_lab_id() {
        assert_eq!(bridge_name("0123456789abcdef"), "ovs-0123456789ab");
        assert_eq!(bridge_name("short"), "ovs-short");
    }

    #[test]
    fn parse_tag_handles_untagged_ports() {
        assert_eq!(parse_tag("[]\n"), None);
        assert_eq!(parse_tag("1042\n"), Some(1042));
        assert_eq!(parse_tag(""), None);
        assert_eq!(parse_tag("garbage"), None);
    }
}
