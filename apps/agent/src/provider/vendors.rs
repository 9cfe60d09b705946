//! Vendor-kind registry.
//!
//! Per-kind behaviour (readiness probes, required env, privileges, flash
//! layout, console shells) is data, not subclasses: provider code is
//! parameterised over a `VendorConfig` looked up by kind string.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Ready as soon as the container runs.
    None,
    /// Grep the container log tail for a pattern.
    LogPattern,
    /// Exec a CLI command and look for expected output.
    CliProbe,
}

#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub kind: &'static str,
    pub console_shell: &'static str,
    pub default_image: Option<&'static str>,
    /// Interface naming as the device expects it (eth1, Ethernet1, e1-1).
    pub interface_prefix: &'static str,
    pub interface_start_index: u32,
    pub max_ports: u32,
    pub environment: &'static [(&'static str, &'static str)],
    pub capabilities: &'static [&'static str],
    pub privileged: bool,
    /// `{workspace}` and `{node}` placeholders are expanded at deploy time.
    pub binds: &'static [&'static str],
    pub sysctls: &'static [(&'static str, &'static str)],
    pub entrypoint: Option<&'static str>,
    pub cmd: Option<&'static [&'static str]>,
    pub readiness_probe: ReadinessProbe,
    pub readiness_pattern: Option<&'static str>,
    pub readiness_cli: Option<&'static [&'static str]>,
    pub readiness_timeout_secs: u64,
    /// Kinds that race on kernel-module load get staggered starts.
    pub stagger_start: bool,
    /// Needs the flash dir + startup-config + zerotouch marker layout.
    pub wants_flash_dir: bool,
    /// Command that prints the running config for extraction on stop.
    pub config_extract_cmd: Option<&'static [&'static str]>,
}

const LINUX: VendorConfig = VendorConfig {
    kind: "linux",
    console_shell: "/bin/sh",
    default_image: Some("alpine:3"),
    interface_prefix: "eth",
    interface_start_index: 1,
    max_ports: 16,
    environment: &[],
    capabilities: &["NET_ADMIN"],
    privileged: false,
    binds: &[],
    sysctls: &[],
    entrypoint: None,
    cmd: Some(&["sleep", "infinity"]),
    readiness_probe: ReadinessProbe::None,
    readiness_pattern: None,
    readiness_cli: None,
    readiness_timeout_secs: 30,
    stagger_start: false,
    wants_flash_dir: false,
    config_extract_cmd: None,
};

const HOST: VendorConfig = VendorConfig {
    kind: "host",
    console_shell: "/bin/bash",
    default_image: Some("ubuntu:22.04"),
    interface_prefix: "eth",
    interface_start_index: 1,
    max_ports: 16,
    environment: &[],
    capabilities: &["NET_ADMIN"],
    privileged: false,
    binds: &[],
    sysctls: &[],
    entrypoint: None,
    cmd: Some(&["sleep", "infinity"]),
    readiness_probe: ReadinessProbe::None,
    readiness_pattern: None,
    readiness_cli: None,
    readiness_timeout_secs: 30,
    stagger_start: false,
    wants_flash_dir: false,
    config_extract_cmd: None,
};

const CEOS: VendorConfig = VendorConfig {
    kind: "ceos",
    console_shell: "Cli",
    default_image: None,
    interface_prefix: "eth",
    interface_start_index: 1,
    max_ports: 64,
    environment: &[
        ("CEOS", "1"),
        ("EOS_PLATFORM", "ceoslab"),
        ("container", "docker"),
        ("ETBA", "1"),
        ("SKIP_ZEROTOUCH_BARRIER_IN_SYSDBINIT", "1"),
        ("INTFTYPE", "eth"),
        ("MGMT_INTF", "eth0"),
        ("CEOS_NOZEROTOUCH", "1"),
    ],
    capabilities: &["NET_ADMIN", "SYS_ADMIN"],
    privileged: true,
    binds: &[
        "{workspace}/configs/{node}/flash:/mnt/flash",
        "{workspace}/configs/{node}/systemd/ceos-env.conf:/etc/systemd/system.conf.d/ceos-env.conf:ro",
    ],
    sysctls: &[("net.ipv4.ip_forward", "1"), ("net.ipv6.conf.all.disable_ipv6", "0")],
    entrypoint: None,
    cmd: Some(&["/sbin/init"]),
    readiness_probe: ReadinessProbe::CliProbe,
    readiness_pattern: None,
    readiness_cli: Some(&["FastCli", "-p", "15", "-c", "show version"]),
    readiness_timeout_secs: 300,
    stagger_start: true,
    wants_flash_dir: true,
    config_extract_cmd: Some(&["FastCli", "-p", "15", "-c", "show running-config"]),
};

const FRR: VendorConfig = VendorConfig {
    kind: "frr",
    console_shell: "vtysh",
    default_image: Some("frrouting/frr:latest"),
    interface_prefix: "eth",
    interface_start_index: 1,
    max_ports: 32,
    environment: &[],
    capabilities: &["NET_ADMIN", "SYS_ADMIN"],
    privileged: false,
    binds: &[],
    sysctls: &[("net.ipv4.ip_forward", "1")],
    entrypoint: None,
    cmd: None,
    readiness_probe: ReadinessProbe::LogPattern,
    // Checked as literal alternatives against the log tail.
    readiness_pattern: Some("all daemons up|watchfrr"),
    readiness_cli: None,
    readiness_timeout_secs: 60,
    stagger_start: false,
    wants_flash_dir: false,
    config_extract_cmd: None,
};

const SRL: VendorConfig = VendorConfig {
    kind: "srl",
    console_shell: "sr_cli",
    default_image: None,
    interface_prefix: "e1-",
    interface_start_index: 1,
    max_ports: 34,
    environment: &[("SRLINUX", "1")],
    capabilities: &["NET_ADMIN", "SYS_ADMIN"],
    privileged: true,
    binds: &[],
    sysctls: &[("net.ipv4.ip_forward", "1")],
    entrypoint: None,
    cmd: None,
    readiness_probe: ReadinessProbe::LogPattern,
    readiness_pattern: Some("mgmt_server"),
    readiness_cli: None,
    readiness_timeout_secs: 180,
    stagger_start: false,
    wants_flash_dir: false,
    config_extract_cmd: None,
};

/// Look up a vendor kind; aliases collapse onto the canonical kind.
pub fn vendor_config(kind: &str) -> &'static VendorConfig {
    match kind {
        "ceos" | "eos" | "arista_ceos" => &CEOS,
        "frr" | "frrouting" => &FRR,
        "srl" | "srlinux" | "nokia_srlinux" => &SRL,
        "host" => &HOST,
        _ => &LINUX,
    }
}

/// Expand `{workspace}`/`{node}` placeholders in a vendor bind spec.
pub fn expand_bind(template: &str, workspace: &str, node: &str) -> String {
    template.replace("{workspace}", workspace).replace("{node}", node)
}

/// Console shells per kind for the WebSocket console.
pub fn console_shell(kind: &str) -> &'static str {
    vendor_config(kind).console_shell
}

pub fn vendor_environment(config: &VendorConfig) -> HashMap<String, String> {
    config
        .environment
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_canonical_kinds() {
        assert_eq!(vendor_config("eos").kind, "ceos");
        assert_eq!(vendor_config("srlinux").kind, "srl");
        assert_eq!(vendor_config("something-new").kind, "linux");
    }

    #[test]
    fn ceos_carries_boot_environment() {
        let env = vendor_environment(vendor_config("ceos"));
        assert_eq!(env.get("EOS_PLATFORM").map(String::as_str), Some("ceoslab"));
        assert!(vendor_config("ceos").privileged);
        assert!(vendor_config("ceos").stagger_start);
    }

    #[test]
    fn bind_templates_expand() {
        let bind = expand_bind(
            "{workspace}/configs/{node}/flash:/mnt/flash",
            "/var/lib/trellis-agent/lab1",
            "r1",
        );
        assert_eq!(bind, "/var/lib/trellis-agent/lab1/configs/r1/flash:/mnt/flash");
    }
}
