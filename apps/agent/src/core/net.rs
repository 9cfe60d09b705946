//! `ip link` / `nsenter` plumbing shared by the plugin, the overlay manager
//! and the link manager.

use anyhow::{anyhow, bail, Context, Result};

use crate::core::cmd;

pub async fn link_exists(name: &str) -> bool {
    matches!(
        cmd::run("ip", &["link", "show", name]).await,
        Ok(out) if out.success()
    )
}

pub async fn create_veth_pair(host_end: &str, cont_end: &str) -> Result<()> {
    let out = cmd::run(
        "ip",
        &["link", "add", host_end, "type", "veth", "peer", "name", cont_end],
    )
    .await?;
    if !out.success() {
        bail!(
            "failed to create veth pair {host_end}/{cont_end}: {}",
            out.stderr_trimmed()
        );
    }
    Ok(())
}

/// Delete a link. Deleting one end of a veth pair destroys the peer too.
pub async fn delete_link(name: &str) -> Result<()> {
    let out = cmd::run("ip", &["link", "delete", name]).await?;
    if out.success() {
        return Ok(());
    }
    let stderr = out.stderr_trimmed();
    if stderr.contains("Cannot find device") || stderr.contains("does not exist") || stderr.is_empty()
    {
        return Ok(());
    }
    bail!("failed to delete link {name}: {stderr}")
}

pub async fn set_link_up(name: &str) -> Result<()> {
    let out = cmd::run("ip", &["link", "set", name, "up"]).await?;
    if !out.success() {
        bail!("failed to bring up {name}: {}", out.stderr_trimmed());
    }
    Ok(())
}

/// Move an interface into the network namespace of `pid`.
pub async fn move_to_netns(name: &str, pid: i64) -> Result<()> {
    let pid = pid.to_string();
    let out = cmd::run("ip", &["link", "set", name, "netns", &pid]).await?;
    if !out.success() {
        bail!(
            "failed to move {name} into netns of pid {pid}: {}",
            out.stderr_trimmed()
        );
    }
    Ok(())
}

/// Run `ip <args>` inside the network namespace of `pid`.
pub async fn ip_in_netns(pid: i64, args: &[&str]) -> Result<cmd::CmdOutput> {
    let pid = pid.to_string();
    let mut full: Vec<&str> = vec!["-t", &pid, "-n", "ip"];
    full.extend_from_slice(args);
    Ok(cmd::run("nsenter", &full).await?)
}

/// Rename an interface inside a container namespace and bring it up.
pub async fn rename_in_netns(pid: i64, from: &str, to: &str) -> Result<()> {
    let out = ip_in_netns(pid, &["link", "set", from, "name", to]).await?;
    if !out.success() {
        bail!(
            "failed to rename {from} to {to} in netns {pid}: {}",
            out.stderr_trimmed()
        );
    }
    let out = ip_in_netns(pid, &["link", "set", to, "up"]).await?;
    if !out.success() {
        bail!("failed to bring up {to} in netns {pid}: {}", out.stderr_trimmed());
    }
    Ok(())
}

/// Resolve the host-side peer of a container interface.
///
/// Reads `/sys/class/net/<iface>/iflink` inside the container namespace to
/// get the peer ifindex, then scans `ip -o link show` in the host namespace
/// for the interface with that index.
pub async fn host_peer_of(pid: i64, iface: &str) -> Result<String> {
    let iflink_path = format!("/sys/class/net/{iface}/iflink");
    let pid_str = pid.to_string();
    let out = cmd::run("nsenter", &["-t", &pid_str, "-n", "cat", &iflink_path]).await?;
    if !out.success() {
        bail!(
            "could not read iflink for {iface} in netns {pid}: {}",
            out.stderr_trimmed()
        );
    }
    let peer_index: u64 = out
        .stdout
        .trim()
        .parse()
        .with_context(|| format!("unexpected iflink value {:?}", out.stdout.trim()))?;

    let listing = cmd::run("ip", &["-o", "link", "show"]).await?;
    if !listing.success() {
        bail!("ip link show failed: {}", listing.stderr_trimmed());
    }

    parse_link_by_index(&listing.stdout, peer_index)
        .ok_or_else(|| anyhow!("no host interface with ifindex {peer_index} for {iface}"))
}

/// Parse `ip -o link show` output for the interface with the given index.
/// Lines look like `123: vh1a2b3c@if456: <BROADCAST,...> ...`.
fn parse_link_by_index(listing: &str, index: u64) -> Option<String> {
    let wanted = format!("{index}:");
    for line in listing.lines() {
        let mut parts = line.splitn(3, ':');
        let idx = parts.next()?.trim();
        if format!("{idx}:") != wanted {
            continue;
        }
        let name = parts.next()?.trim();
        let name = name.split('@').next().unwrap_or(name);
        return Some(name.to_string());
    }
    None
}

/// Create a VXLAN interface for a point-to-point tunnel.
pub async fn create_vxlan_iface(
    name: &str,
    vni: u32,
    local_ip: &str,
    remote_ip: &str,
    dst_port: u16,
) -> Result<()> {
    let vni = vni.to_string();
    let dst_port = dst_port.to_string();
    let out = cmd::run(
        "ip",
        &[
            "link", "add", name, "type", "vxlan", "id", &vni, "local", local_ip, "remote",
            remote_ip, "dstport", &dst_port,
        ],
    )
    .await?;
    if !out.success() && !out.stderr.contains("File exists") {
        bail!("failed to create VXLAN interface {name}: {}", out.stderr_trimmed());
    }
    Ok(())
}

pub async fn create_linux_bridge(name: &str) -> Result<()> {
    let out = cmd::run("ip", &["link", "add", name, "type", "bridge"]).await?;
    if !out.success() {
        bail!("failed to create bridge {name}: {}", out.stderr_trimmed());
    }
    set_link_up(name).await
}

pub async fn set_link_master(name: &str, master: &str) -> Result<()> {
    let out = cmd::run("ip", &["link", "set", name, "master", master]).await?;
    if !out.success() {
        bail!(
            "failed to attach {name} to bridge {master}: {}",
            out.stderr_trimmed()
        );
    }
    Ok(())
}

/// Configure a CIDR address on an interface inside a container namespace.
pub async fn add_addr_in_netns(pid: i64, iface: &str, cidr: &str) -> Result<()> {
    let out = ip_in_netns(pid, &["addr", "add", cidr, "dev", iface]).await?;
    if !out.success() {
        bail!(
            "failed to configure {cidr} on {iface} in netns {pid}: {}",
            out.stderr_trimmed()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_interface_by_index() {
        let listing = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP
47: vh1a2b3c@if3: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue master ovs-system state UP
";
        assert_eq!(parse_link_by_index(listing, 47).as_deref(), Some("vh1a2b3c"));
        assert_eq!(parse_link_by_index(listing, 2).as_deref(), Some("eth0"));
        assert_eq!(parse_link_by_index(listing, 99), None);
    }
}
