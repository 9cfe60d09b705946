//! Native Docker provider.
//!
//! Containers are created attached to per-interface Docker networks served
//! by the OVS plugin, so every NIC exists, is named per the topology and is
//! isolated on the lab bridge before the image's init process runs. Links
//! are then made by retagging (hot connect), and the whole lab tears down to
//! containers + volumes + networks + bridge.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{EndpointSettings, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::CreateNetworkOptions;
use bollard::volume::{ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use trellis_types::{NodeInfo, NodeStatus};

use crate::config::AgentConfig;
use crate::network::plugin::{DockerOvsPlugin, LABEL_LAB_ID, PLUGIN_NAME};
use crate::provider::topology::{self, ParsedTopology};
use crate::provider::vendors::{self, ReadinessProbe, VendorConfig};
use crate::provider::{DeployOutcome, DestroyOutcome, NodeActionOutcome, StatusOutcome};

pub const CONTAINER_PREFIX: &str = "trellis";
pub const LABEL_NODE_NAME: &str = "trellis.node_name";
pub const LABEL_NODE_DISPLAY_NAME: &str = "trellis.node_display_name";
pub const LABEL_NODE_KIND: &str = "trellis.node_kind";
pub const LABEL_PROVIDER: &str = "trellis.provider";

pub struct DockerProvider {
    docker: Docker,
    plugin: Arc<DockerOvsPlugin>,
    use_plugin: bool,
    container_stop_timeout: Duration,
    readiness_poll: Duration,
}

fn sanitize(value: &str, max: usize) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(max)
        .collect()
}

pub fn container_name(lab_id: &str, node_name: &str) -> String {
    format!(
        "{CONTAINER_PREFIX}-{}-{}",
        sanitize(lab_id, 20),
        sanitize(node_name, usize::MAX)
    )
}

pub fn lab_prefix(lab_id: &str) -> String {
    format!("{CONTAINER_PREFIX}-{}", sanitize(lab_id, 20))
}

fn interface_network_name(lab_id: &str, index: u32) -> String {
    format!("{lab_id}-eth{index}")
}

impl DockerProvider {
    pub fn new(docker: Docker, plugin: Arc<DockerOvsPlugin>, cfg: &AgentConfig) -> Self {
        Self {
            docker,
            plugin,
            use_plugin: cfg.enable_ovs && cfg.enable_ovs_plugin,
            container_stop_timeout: cfg.container_stop_timeout,
            readiness_poll: Duration::from_secs(5),
        }
    }

    // =========================================================================
    // Deploy
    // =========================================================================

    pub async fn deploy(
        &self,
        lab_id: &str,
        topology_yaml: &str,
        workspace: &Path,
    ) -> DeployOutcome {
        let parsed = match topology::parse_topology(topology_yaml, lab_id) {
            Ok(parsed) => parsed,
            Err(err) => {
                return DeployOutcome {
                    error: Some(format!("invalid topology: {err:#}")),
                    ..Default::default()
                }
            }
        };
        if let Err(err) = topology::require_nodes(&parsed) {
            return DeployOutcome {
                error: Some(err.to_string()),
                ..Default::default()
            };
        }

        info!(lab_id = %lab_id, nodes = parsed.nodes.len(), links = parsed.links.len(), "deploying lab");

        // Half-created containers from a crashed previous attempt would make
        // create calls fail with name conflicts.
        if let Err(err) = self.pre_deploy_cleanup(lab_id).await {
            warn!(lab_id = %lab_id, error = %err, "pre-deploy cleanup failed");
        }

        // Image validation happens before any mutation and reports every
        // missing (node, image) pair at once.
        let missing = self.validate_images(&parsed).await;
        if !missing.is_empty() {
            let mut lines = vec!["Missing Docker images:".to_string()];
            for (node_name, image) in &missing {
                lines.push(format!(
                    "  - node '{}' requires: {image}",
                    parsed.log_name(node_name)
                ));
            }
            lines.push(String::new());
            lines.push("Please upload the images to this host before deploying.".to_string());
            return DeployOutcome {
                success: false,
                error: Some(format!("missing {} Docker image(s)", missing.len())),
                stderr: lines.join("\n"),
                ..Default::default()
            };
        }

        if let Err(err) = self.ensure_directories(&parsed, workspace).await {
            return DeployOutcome {
                error: Some(format!("failed to prepare workspace: {err:#}")),
                ..Default::default()
            };
        }

        if let Err(err) = self.plugin.create_management_network(lab_id).await {
            warn!(lab_id = %lab_id, error = %err, "failed to create management network");
        }

        let containers = match self.create_containers(&parsed, lab_id, workspace).await {
            Ok(containers) => containers,
            Err(err) => {
                return DeployOutcome {
                    error: Some(format!("failed to create containers: {err:#}")),
                    ..Default::default()
                }
            }
        };

        let failed_starts = self.start_containers(&parsed, &containers).await;
        if !failed_starts.is_empty() {
            let names: Vec<String> = failed_starts.iter().map(|n| parsed.log_name(n)).collect();
            warn!(lab_id = %lab_id, nodes = ?names, "some containers failed to start");
        }

        self.associate_endpoints(lab_id, &containers).await;

        let links_created = self.create_links(&parsed, lab_id).await;
        info!(lab_id = %lab_id, links = links_created, "created links");

        let ready = self.wait_for_readiness(&parsed, lab_id).await;
        let not_ready: Vec<&str> = ready
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
            .collect();

        let status = self.status(lab_id).await;

        let mut stdout_lines = vec![
            format!("Deployed {} containers", containers.len()),
            format!("Created {links_created} links"),
        ];
        if !not_ready.is_empty() {
            let names: Vec<String> = not_ready.iter().map(|n| parsed.log_name(n)).collect();
            stdout_lines.push(format!(
                "Warning: {} nodes not fully ready: {}",
                names.len(),
                names.join(", ")
            ));
        }

        DeployOutcome {
            success: true,
            stdout: stdout_lines.join("\n"),
            stderr: String::new(),
            error: None,
            nodes: status.nodes,
        }
    }

    /// Report every topology image missing from the local daemon.
    async fn validate_images(&self, parsed: &ParsedTopology) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for (node_name, node) in &parsed.nodes {
            let vendor = vendors::vendor_config(&node.kind);
            let image = node
                .image
                .clone()
                .or_else(|| vendor.default_image.map(str::to_string));
            let Some(image) = image else { continue };

            match self.docker.inspect_image(&image).await {
                Ok(_) => {}
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => missing.push((node_name.clone(), image)),
                Err(err) => warn!(image = %image, error = %err, "error checking image"),
            }
        }
        missing
    }

    /// cEOS wants its flash directory, a startup-config, a zerotouch marker
    /// and a systemd env file (systemd services do not inherit the container
    /// environment).
    async fn ensure_directories(&self, parsed: &ParsedTopology, workspace: &Path) -> Result<()> {
        for (node_name, node) in &parsed.nodes {
            let vendor = vendors::vendor_config(&node.kind);
            if !vendor.wants_flash_dir {
                continue;
            }

            let flash_dir = workspace.join("configs").join(node_name).join("flash");
            tokio::fs::create_dir_all(&flash_dir).await?;

            let systemd_dir = workspace.join("configs").join(node_name).join("systemd");
            tokio::fs::create_dir_all(&systemd_dir).await?;
            tokio::fs::write(
                systemd_dir.join("ceos-env.conf"),
                "[Manager]\n\
                 DefaultEnvironment=EOS_PLATFORM=ceoslab CEOS=1 container=docker ETBA=1 \
                 SKIP_ZEROTOUCH_BARRIER_IN_SYSDBINIT=1 INTFTYPE=eth MGMT_INTF=eth0 \
                 CEOS_NOZEROTOUCH=1\n",
            )
            .await?;

            let startup_config = flash_dir.join("startup-config");
            let extracted = workspace.join("configs").join(node_name).join("startup-config");
            if let Some(config) = &node.startup_config {
                tokio::fs::write(&startup_config, config).await?;
            } else if tokio::fs::metadata(&extracted).await.is_ok() {
                // Resume from the config captured at the last stop.
                tokio::fs::copy(&extracted, &startup_config).await?;
            } else if tokio::fs::metadata(&startup_config).await.is_err() {
                let minimal = format!(
                    "! Minimal startup config\n\
                     hostname {node_name}\n\
                     !\n\
                     no aaa root\n\
                     !\n\
                     username admin privilege 15 role network-admin nopassword\n\
                     !\n"
                );
                tokio::fs::write(&startup_config, minimal).await?;
            }

            let zerotouch = flash_dir.join("zerotouch-config");
            if tokio::fs::metadata(&zerotouch).await.is_err() {
                tokio::fs::write(&zerotouch, "DISABLE=True\n").await?;
            }
        }
        Ok(())
    }

    /// Remove `created`/`exited`/`dead` leftovers matching this lab before a
    /// fresh attempt.
    async fn pre_deploy_cleanup(&self, lab_id: &str) -> Result<()> {
        let containers = self.list_lab_containers(lab_id).await?;
        for container in containers {
            let state = container.state.as_deref().unwrap_or_default();
            if matches!(state, "created" | "exited" | "dead") {
                if let Some(name) = primary_name(&container) {
                    info!(container = %name, state = %state, "removing stale container before deploy");
                    let _ = self
                        .docker
                        .remove_container(
                            &name,
                            Some(RemoveContainerOptions {
                                force: true,
                                v: true,
                                ..Default::default()
                            }),
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn create_lab_networks(&self, lab_id: &str, count: u32) -> Result<()> {
        for index in 1..=count {
            let network_name = interface_network_name(lab_id, index);
            if self
                .docker
                .inspect_network::<String>(&network_name, None)
                .await
                .is_ok()
            {
                continue;
            }

            let options = CreateNetworkOptions {
                name: network_name.clone(),
                driver: PLUGIN_NAME.to_string(),
                // L2-only networks: the null IPAM driver keeps Docker from
                // burning a subnet per interface slot.
                ipam: bollard::models::Ipam {
                    driver: Some("null".to_string()),
                    ..Default::default()
                },
                options: HashMap::from([
                    ("lab_id".to_string(), lab_id.to_string()),
                    ("interface_name".to_string(), format!("eth{index}")),
                ]),
                ..Default::default()
            };
            self.docker
                .create_network(options)
                .await
                .with_context(|| format!("creating network {network_name}"))?;
            debug!(network = %network_name, "created interface network");
        }
        info!(lab_id = %lab_id, count, "created interface networks");
        Ok(())
    }

    async fn delete_lab_networks(&self, lab_id: &str) -> u32 {
        let mut deleted = 0;
        let networks = match self.docker.list_networks::<String>(None).await {
            Ok(networks) => networks,
            Err(err) => {
                warn!(lab_id = %lab_id, error = %err, "failed to list networks");
                return 0;
            }
        };
        let prefix = format!("{lab_id}-");
        for network in networks {
            let Some(name) = network.name else { continue };
            if !name.starts_with(&prefix) {
                continue;
            }
            match self.docker.remove_network(&name).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(network = %name, "deleted network");
                }
                Err(err) => warn!(network = %name, error = %err, "failed to delete network"),
            }
        }
        if deleted > 0 {
            info!(lab_id = %lab_id, deleted, "deleted interface networks");
        }
        deleted
    }

    fn build_container_config(
        &self,
        node: &topology::TopologyNode,
        vendor: &VendorConfig,
        lab_id: &str,
        workspace: &Path,
        first_network: &str,
    ) -> Config<String> {
        let image = node
            .image
            .clone()
            .or_else(|| vendor.default_image.map(str::to_string))
            .unwrap_or_default();

        let mut env = vendors::vendor_environment(vendor);
        env.extend(node.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let env: Vec<String> = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut labels = HashMap::from([
            (LABEL_LAB_ID.to_string(), lab_id.to_string()),
            (LABEL_NODE_NAME.to_string(), node.name.clone()),
            (LABEL_NODE_KIND.to_string(), node.kind.clone()),
            (LABEL_PROVIDER.to_string(), "docker".to_string()),
        ]);
        if let Some(display) = &node.display_name {
            labels.insert(LABEL_NODE_DISPLAY_NAME.to_string(), display.clone());
        }

        let workspace_str = workspace.display().to_string();
        let mut binds: Vec<String> = vendor
            .binds
            .iter()
            .map(|template| vendors::expand_bind(template, &workspace_str, &node.name))
            .collect();
        binds.extend(node.binds.iter().cloned());

        let sysctls: HashMap<String, String> = vendor
            .sysctls
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let host_config = HostConfig {
            cap_add: Some(vendor.capabilities.iter().map(|c| c.to_string()).collect()),
            privileged: Some(vendor.privileged),
            binds: if binds.is_empty() { None } else { Some(binds) },
            sysctls: if sysctls.is_empty() { None } else { Some(sysctls) },
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            ..Default::default()
        };

        let networking_config = bollard::container::NetworkingConfig {
            endpoints_config: HashMap::from([(
                first_network.to_string(),
                EndpointSettings::default(),
            )]),
        };

        let mut config = Config {
            image: Some(image),
            hostname: Some(node.name.clone()),
            env: Some(env),
            labels: Some(labels),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            networking_config: Some(networking_config),
            ..Default::default()
        };
        if let Some(entrypoint) = vendor.entrypoint {
            config.entrypoint = Some(vec![entrypoint.to_string()]);
        }
        if let Some(cmd) = vendor.cmd {
            config.cmd = Some(cmd.iter().map(|c| c.to_string()).collect());
        }
        // Images like cEOS ship ENTRYPOINT []; something has to keep PID 1
        // alive.
        if config.entrypoint.is_none() && config.cmd.is_none() {
            config.cmd = Some(vec!["sleep".to_string(), "infinity".to_string()]);
        }
        config
    }

    /// Create all containers attached to their interface networks. Any
    /// failure rolls back every container and network created so far so IP
    /// pools and names do not leak.
    async fn create_containers(
        &self,
        parsed: &ParsedTopology,
        lab_id: &str,
        workspace: &Path,
    ) -> Result<Vec<String>> {
        let required_interfaces = parsed.required_interfaces();
        info!(lab_id = %lab_id, interfaces = required_interfaces, "interface budget");

        if self.use_plugin {
            self.create_lab_networks(lab_id, required_interfaces).await?;
        }

        let mut created: Vec<String> = Vec::new();
        let result: Result<()> = async {
            for (node_name, node) in &parsed.nodes {
                let vendor = vendors::vendor_config(&node.kind);
                let name = container_name(lab_id, node_name);
                let log_name = node.log_name();

                match self.docker.inspect_container(&name, None).await {
                    Ok(existing) => {
                        let running = existing
                            .state
                            .as_ref()
                            .and_then(|state| state.running)
                            .unwrap_or(false);
                        if running {
                            info!(container = %log_name, "container already running");
                            created.push(name);
                            continue;
                        }
                        info!(container = %log_name, "removing stopped container");
                        self.docker
                            .remove_container(
                                &name,
                                Some(RemoveContainerOptions {
                                    force: true,
                                    v: true,
                                    ..Default::default()
                                }),
                            )
                            .await?;
                    }
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 404,
                        ..
                    }) => {}
                    Err(err) => return Err(err.into()),
                }

                let first_network = interface_network_name(lab_id, 1);
                let config =
                    self.build_container_config(node, vendor, lab_id, workspace, &first_network);

                info!(container = %log_name, image = ?config.image, "creating container");
                self.docker
                    .create_container(
                        Some(CreateContainerOptions {
                            name: name.clone(),
                            platform: None,
                        }),
                        config,
                    )
                    .await
                    .with_context(|| format!("creating container {log_name}"))?;
                created.push(name.clone());

                // eth1 was attached at create; connect the remaining slots
                // before start so every interface exists at boot.
                if self.use_plugin {
                    for index in 2..=required_interfaces {
                        let network_name = interface_network_name(lab_id, index);
                        if let Err(err) = self
                            .docker
                            .connect_network(
                                &network_name,
                                bollard::network::ConnectNetworkOptions {
                                    container: name.clone(),
                                    endpoint_config: EndpointSettings::default(),
                                },
                            )
                            .await
                        {
                            if !err.to_string().contains("already exists") {
                                warn!(container = %log_name, network = %network_name, error = %err, "failed to attach network");
                            }
                        }
                    }
                }

                // Management network connection for eth0/NAT. Advisory: a lab
                // without management access still deploys.
                match self.plugin.attach_to_management(&name, lab_id).await {
                    Ok(ip) => debug!(container = %log_name, ip = ?ip, "attached to management network"),
                    Err(err) => {
                        warn!(container = %log_name, error = %err, "management network attach failed")
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            error!(lab_id = %lab_id, error = %err, "container creation failed, rolling back");
            for name in &created {
                let _ = self
                    .docker
                    .remove_container(
                        name,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await;
            }
            if self.use_plugin {
                self.delete_lab_networks(lab_id).await;
            }
            return Err(err);
        }

        Ok(created)
    }

    /// Start every container. Kinds flagged for staggering (cEOS races on
    /// kernel module load) get a few seconds between starts. Returns node
    /// names that failed to start.
    async fn start_containers(&self, parsed: &ParsedTopology, containers: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        let mut stagger_started = false;

        for (node_name, node) in &parsed.nodes {
            let vendor = vendors::vendor_config(&node.kind);
            let Some(name) = containers
                .iter()
                .find(|c| c.ends_with(&format!("-{}", sanitize(node_name, usize::MAX))))
            else {
                continue;
            };

            if vendor.stagger_start && stagger_started {
                info!(container = %node.log_name(), "staggering start");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }

            match self
                .docker
                .start_container(name, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(()) => {
                    info!(container = %node.log_name(), "started container");
                    if vendor.stagger_start {
                        stagger_started = true;
                    }
                }
                Err(err) if err.to_string().contains("already started") => {}
                Err(err) => {
                    error!(container = %node.log_name(), error = %err, "failed to start container");
                    failed.push(node_name.clone());
                }
            }
        }
        failed
    }

    /// Docker only binds containers to plugin endpoints at Join, and Join
    /// carries no container name. Read each started container's endpoint ids
    /// and teach the plugin the association so hot-connect can resolve by
    /// `container:interface`.
    async fn associate_endpoints(&self, lab_id: &str, containers: &[String]) {
        for name in containers {
            let Ok(inspect) = self.docker.inspect_container(name, None).await else {
                continue;
            };
            let networks = inspect
                .network_settings
                .and_then(|settings| settings.networks)
                .unwrap_or_default();
            for (network_name, endpoint) in networks {
                if !network_name.starts_with(&format!("{lab_id}-")) {
                    continue;
                }
                if let Some(endpoint_id) = endpoint.endpoint_id.filter(|id| !id.is_empty()) {
                    self.plugin
                        .set_endpoint_container_name(&endpoint_id, name)
                        .await;
                }
            }
        }
    }

    async fn create_links(&self, parsed: &ParsedTopology, lab_id: &str) -> u32 {
        let mut created = 0;
        for link in &parsed.links {
            let container_a = container_name(lab_id, &link.a.node);
            let container_b = container_name(lab_id, &link.b.node);
            match self
                .plugin
                .hot_connect(
                    lab_id,
                    &container_a,
                    &link.a.interface,
                    &container_b,
                    &link.b.interface,
                )
                .await
            {
                Ok(_) => created += 1,
                Err(err) => {
                    let link_id = topology::link_id(
                        &link.a.node,
                        &link.a.interface,
                        &link.b.node,
                        &link.b.interface,
                    );
                    error!(link = %link_id, error = %err, "failed to create link");
                }
            }
        }
        created
    }

    /// Poll vendor readiness probes. Non-readiness is reported, never fatal:
    /// slow-boot NOS images routinely outlive conservative timeouts.
    async fn wait_for_readiness(
        &self,
        parsed: &ParsedTopology,
        lab_id: &str,
    ) -> HashMap<String, bool> {
        let mut ready: HashMap<String, bool> = HashMap::new();
        let mut deadline_secs: u64 = 0;
        for (node_name, node) in &parsed.nodes {
            let vendor = vendors::vendor_config(&node.kind);
            let instantly = vendor.readiness_probe == ReadinessProbe::None;
            ready.insert(node_name.clone(), instantly);
            if !instantly {
                deadline_secs = deadline_secs.max(vendor.readiness_timeout_secs);
            }
        }
        if ready.values().all(|ok| *ok) {
            return ready;
        }

        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() > Duration::from_secs(deadline_secs) {
                break;
            }

            for (node_name, node) in &parsed.nodes {
                if ready[node_name] {
                    continue;
                }
                let vendor = vendors::vendor_config(&node.kind);
                if started.elapsed() > Duration::from_secs(vendor.readiness_timeout_secs) {
                    warn!(node = %node.log_name(), "timed out waiting for readiness");
                    continue;
                }

                let name = container_name(lab_id, node_name);
                let is_ready = match vendor.readiness_probe {
                    ReadinessProbe::None => true,
                    ReadinessProbe::LogPattern => {
                        self.probe_logs(&name, vendor.readiness_pattern).await
                    }
                    ReadinessProbe::CliProbe => {
                        self.probe_cli(&name, vendor.readiness_cli).await
                    }
                };
                if is_ready {
                    info!(node = %node.log_name(), "node is ready");
                    ready.insert(node_name.clone(), true);
                }
            }

            if ready.values().all(|ok| *ok) {
                break;
            }
            tokio::time::sleep(self.readiness_poll).await;
        }
        ready
    }

    async fn probe_logs(&self, container: &str, pattern: Option<&str>) -> bool {
        let Some(pattern) = pattern else { return true };
        let mut stream = self.docker.logs(
            container,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "100".to_string(),
                ..Default::default()
            }),
        );
        let mut tail = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => tail.push_str(&output.to_string()),
                Err(_) => return false,
            }
        }
        // Vendor patterns are simple substrings or alternations; check each
        // alternative literally rather than pulling in a regex engine.
        pattern
            .trim_start_matches("(?i)")
            .split('|')
            .any(|needle| tail.to_lowercase().contains(&needle.to_lowercase()))
    }

    async fn probe_cli(&self, container: &str, cli: Option<&[&str]>) -> bool {
        let Some(cli) = cli else { return true };
        match self.exec_capture(container, cli).await {
            Ok((code, _)) => code == 0,
            Err(_) => false,
        }
    }

    async fn exec_capture(&self, container: &str, cmd: &[&str]) -> Result<(i64, String)> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(|c| c.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                if let Ok(log) = chunk {
                    collected.push_str(&log.to_string());
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok((inspect.exit_code.unwrap_or(-1), collected))
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    pub async fn destroy(&self, lab_id: &str, workspace: &Path) -> DestroyOutcome {
        let mut errors: Vec<String> = Vec::new();
        let mut removed = 0;

        match self.list_lab_containers(lab_id).await {
            Ok(containers) => {
                for container in containers {
                    let Some(name) = primary_name(&container) else { continue };
                    match self
                        .docker
                        .remove_container(
                            &name,
                            Some(RemoveContainerOptions {
                                force: true,
                                v: true,
                                ..Default::default()
                            }),
                        )
                        .await
                    {
                        Ok(()) => {
                            removed += 1;
                            info!(container = %name, "removed container");
                        }
                        Err(err) => errors.push(format!("failed to remove {name}: {err}")),
                    }
                }
            }
            Err(err) => errors.push(format!("failed to list containers: {err}")),
        }

        let volumes_removed = self.cleanup_lab_volumes(lab_id).await;

        if self.use_plugin {
            let networks_deleted = self.delete_lab_networks(lab_id).await;
            debug!(lab_id = %lab_id, networks_deleted, "network cleanup");
        }
        if let Err(err) = self.plugin.cleanup_lab(lab_id).await {
            errors.push(format!("plugin cleanup: {err:#}"));
        }

        let _ = workspace; // workspace files (configs) survive destroy on purpose

        let mut stdout_parts = vec![format!("Removed {removed} containers")];
        if volumes_removed > 0 {
            stdout_parts.push(format!("Removed {volumes_removed} volumes"));
        }

        DestroyOutcome {
            success: errors.is_empty(),
            stdout: stdout_parts.join(", "),
            stderr: errors.join("\n"),
            error: errors.first().cloned(),
        }
    }

    async fn cleanup_lab_volumes(&self, lab_id: &str) -> u32 {
        let mut removed = 0;
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{LABEL_LAB_ID}={lab_id}")],
        )]);
        match self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await
        {
            Ok(response) => {
                for volume in response.volumes.unwrap_or_default() {
                    match self
                        .docker
                        .remove_volume(&volume.name, Some(RemoveVolumeOptions { force: true }))
                        .await
                    {
                        Ok(()) => removed += 1,
                        Err(err) => debug!(volume = %volume.name, error = %err, "could not remove volume"),
                    }
                }
            }
            Err(err) => warn!(lab_id = %lab_id, error = %err, "failed to list volumes"),
        }
        removed
    }

    // =========================================================================
    // Status / node actions / discovery
    // =========================================================================

    async fn list_lab_containers(
        &self,
        lab_id: &str,
    ) -> Result<Vec<bollard::models::ContainerSummary>> {
        let by_label = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([(
                    "label".to_string(),
                    vec![format!("{LABEL_LAB_ID}={lab_id}")],
                )]),
                ..Default::default()
            }))
            .await?;

        // Prefix match as fallback for containers whose labels were lost.
        let by_name = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([(
                    "name".to_string(),
                    vec![lab_prefix(lab_id)],
                )]),
                ..Default::default()
            }))
            .await?;

        let mut merged: HashMap<String, bollard::models::ContainerSummary> = HashMap::new();
        for container in by_label.into_iter().chain(by_name) {
            if let Some(id) = container.id.clone() {
                merged.insert(id, container);
            }
        }
        Ok(merged.into_values().collect())
    }

    pub async fn status(&self, lab_id: &str) -> StatusOutcome {
        match self.list_lab_containers(lab_id).await {
            Ok(containers) => {
                let nodes: Vec<NodeInfo> = containers.iter().filter_map(node_info).collect();
                StatusOutcome {
                    lab_exists: !nodes.is_empty(),
                    nodes,
                    error: None,
                }
            }
            Err(err) => StatusOutcome {
                lab_exists: false,
                nodes: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn start_node(&self, lab_id: &str, node_name: &str) -> NodeActionOutcome {
        let name = container_name(lab_id, node_name);
        match self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => NodeActionOutcome {
                success: true,
                node_name: node_name.to_string(),
                new_status: Some(NodeStatus::Running),
                stdout: format!("Started container {name}"),
                error: None,
            },
            Err(err) => NodeActionOutcome {
                success: false,
                node_name: node_name.to_string(),
                new_status: None,
                stdout: String::new(),
                error: Some(err.to_string()),
            },
        }
    }

    /// Stop a node. Config-extracting kinds get their running config saved
    /// to `configs/<node>/startup-config` first, so the next deploy boots
    /// from where this one left off.
    pub async fn stop_node(
        &self,
        lab_id: &str,
        node_name: &str,
        workspace: &Path,
    ) -> NodeActionOutcome {
        let name = container_name(lab_id, node_name);

        if let Ok(inspect) = self.docker.inspect_container(&name, None).await {
            let kind = inspect
                .config
                .as_ref()
                .and_then(|config| config.labels.as_ref())
                .and_then(|labels| labels.get(LABEL_NODE_KIND))
                .cloned()
                .unwrap_or_default();
            let vendor = vendors::vendor_config(&kind);
            if let Some(extract_cmd) = vendor.config_extract_cmd {
                match self.exec_capture(&name, extract_cmd).await {
                    Ok((0, output)) if !output.trim().is_empty() => {
                        let config_dir = workspace.join("configs").join(node_name);
                        if let Err(err) = tokio::fs::create_dir_all(&config_dir).await {
                            warn!(node = %node_name, error = %err, "could not create config dir");
                        } else if let Err(err) =
                            tokio::fs::write(config_dir.join("startup-config"), &output).await
                        {
                            warn!(node = %node_name, error = %err, "could not save extracted config");
                        } else {
                            info!(node = %node_name, "extracted running config");
                        }
                    }
                    Ok((code, _)) => {
                        warn!(node = %node_name, exit = code, "config extraction failed")
                    }
                    Err(err) => warn!(node = %node_name, error = %err, "config extraction failed"),
                }
            }
        }

        match self
            .docker
            .stop_container(
                &name,
                Some(StopContainerOptions {
                    t: self.container_stop_timeout.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => NodeActionOutcome {
                success: true,
                node_name: node_name.to_string(),
                new_status: Some(NodeStatus::Stopped),
                stdout: format!("Stopped container {name}"),
                error: None,
            },
            Err(err) => NodeActionOutcome {
                success: false,
                node_name: node_name.to_string(),
                new_status: None,
                stdout: String::new(),
                error: Some(err.to_string()),
            },
        }
    }

    /// Every lab this provider manages on the host, grouped by lab label.
    pub async fn discover_labs(&self) -> HashMap<String, Vec<NodeInfo>> {
        let mut discovered: HashMap<String, Vec<NodeInfo>> = HashMap::new();
        let containers = match self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([(
                    "label".to_string(),
                    vec![format!("{LABEL_PROVIDER}=docker")],
                )]),
                ..Default::default()
            }))
            .await
        {
            Ok(containers) => containers,
            Err(err) => {
                error!(error = %err, "failed to list containers for discovery");
                return discovered;
            }
        };

        for container in &containers {
            let Some(lab_id) = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_LAB_ID))
            else {
                continue;
            };
            if let Some(node) = node_info(container) {
                discovered.entry(lab_id.clone()).or_default().push(node);
            }
        }
        discovered
    }

    /// Remove containers belonging to labs absent from `valid_lab_ids`.
    /// Prefix comparison covers ids that were truncated into names.
    pub async fn cleanup_orphans(&self, valid_lab_ids: &[String]) -> (Vec<String>, Vec<String>) {
        let mut removed = Vec::new();
        let mut errors = Vec::new();

        let containers = match self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([(
                    "label".to_string(),
                    vec![format!("{LABEL_PROVIDER}=docker")],
                )]),
                ..Default::default()
            }))
            .await
        {
            Ok(containers) => containers,
            Err(err) => return (removed, vec![err.to_string()]),
        };

        for container in containers {
            let Some(lab_id) = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_LAB_ID))
                .cloned()
            else {
                continue;
            };

            let is_valid = valid_lab_ids.iter().any(|valid| {
                valid == &lab_id
                    || valid.starts_with(&lab_id)
                    || lab_id.starts_with(&valid[..valid.len().min(20)])
            });
            if is_valid {
                continue;
            }

            let Some(name) = primary_name(&container) else { continue };
            info!(container = %name, lab_id = %lab_id, "removing orphan container");
            match self
                .docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => removed.push(name),
                Err(err) => errors.push(format!("{name}: {err}")),
            }
        }
        (removed, errors)
    }
}

fn primary_name(container: &bollard::models::ContainerSummary) -> Option<String> {
    container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
}

fn map_state(state: Option<&str>) -> NodeStatus {
    match state.unwrap_or_default() {
        "running" => NodeStatus::Running,
        "created" => NodeStatus::Pending,
        "restarting" => NodeStatus::Starting,
        "exited" | "dead" | "paused" => NodeStatus::Stopped,
        _ => NodeStatus::Unknown,
    }
}

fn node_info(container: &bollard::models::ContainerSummary) -> Option<NodeInfo> {
    let labels = container.labels.as_ref()?;
    let node_name = labels.get(LABEL_NODE_NAME)?.clone();

    Some(NodeInfo {
        name: node_name,
        status: map_state(container.state.as_deref()),
        container_id: container.id.as_ref().map(|id| id[..id.len().min(12)].to_string()),
        image: container.image.clone(),
        ip_addresses: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_sanitized() {
        assert_eq!(
            container_name("lab/../etc", "r1"),
            "trellis-labetc-r1"
        );
        assert_eq!(
            container_name("0123456789012345678901234", "r1"),
            "trellis-01234567890123456789-r1"
        );
    }

    #[test]
    fn container_state_maps_to_node_status() {
        assert_eq!(map_state(Some("running")), NodeStatus::Running);
        assert_eq!(map_state(Some("created")), NodeStatus::Pending);
        assert_eq!(map_state(Some("exited")), NodeStatus::Stopped);
        assert_eq!(map_state(Some("weird")), NodeStatus::Unknown);
        assert_eq!(map_state(None), NodeStatus::Unknown);
    }

    #[test]
    fn primary_name_strips_leading_slash() {
        let summary = bollard::models::ContainerSummary {
            names: Some(vec!["/trellis-lab-r1".to_string()]),
            ..Default::default()
        };
        assert_eq!(primary_name(&summary).as_deref(), Some("trellis-lab-r1"));
    }
}
