//! Multi-host deploy/destroy orchestration.
//!
//! `lab up`: analyse placements, fail early if any referenced host is
//! missing or stale, deploy each host's sub-topology in parallel, then wire
//! cross-host links through the overlay path with a shared VNI. Overlay
//! failures are warnings (the containers run); host deploy failures fail the
//! whole job and move the lab to `error`.
//!
//! `lab down` reverses: overlay cleanup everywhere first, destroys in
//! parallel, and reports partial failures without blocking the transition to
//! `stopped`.

use std::collections::BTreeMap;

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use trellis_types::{
    AttachContainerRequest, CreateTunnelRequest, DeployRequest, DestroyRequest, JobStatus,
    Provider,
};
use uuid::Uuid;

use crate::core::agent_client::AgentClientError;
use crate::core::selector;
use crate::features::hosts::repo::HostRow;
use crate::features::topology::analyze::{self, CrossHostLink};
use crate::features::topology::yaml;
use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no healthy agent supports provider {provider}")]
    NoAgentAvailable { provider: String },
    #[error("hosts unavailable for deployment: {hosts:?}")]
    MissingHosts { hosts: Vec<String> },
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    #[error("agent unreachable: {0}")]
    AgentUnavailable(String),
    #[error("job failed: {message}")]
    JobFailed { message: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

fn container_name(lab_id: &str, node_name: &str) -> String {
    let safe_lab: String = lab_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(20)
        .collect();
    format!("trellis-{safe_lab}-{node_name}")
}

fn agent_ip(address: &str) -> String {
    address
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string()
}

pub async fn lab_up(st: &AppState, lab_id: &str) -> Result<String, OrchestratorError> {
    // Existence check; RowNotFound surfaces before anything mutates.
    let _lab = st.labs.get(lab_id).await?;
    let nodes = st.topology.nodes(lab_id).await?;
    let links = st.topology.links(lab_id).await?;
    let placements = st.topology.placements(lab_id).await?;

    if nodes.is_empty() {
        return Err(OrchestratorError::InvalidTopology(
            "lab has no nodes".to_string(),
        ));
    }

    // Default host for unpinned nodes: the lab's affinity agent, else the
    // least-loaded capable one.
    let default_agent = selector::agent_for_lab(st, lab_id, Some("docker")).await?;
    let analysis = analyze::analyze(
        &nodes,
        &links,
        &placements,
        default_agent.as_ref().map(|agent| agent.id.as_str()),
    );

    if !analysis.unplaced.is_empty() {
        return Err(OrchestratorError::NoAgentAvailable {
            provider: "docker".to_string(),
        });
    }

    // Resolve every target host up front; a single missing or stale host
    // fails the deploy before anything mutates.
    let mut agents: BTreeMap<String, HostRow> = BTreeMap::new();
    let mut missing = Vec::new();
    for host_ref in analysis.placements.keys() {
        match st.hosts.get_by_name_or_id(host_ref).await? {
            Some(host)
                if host.derived_status() == "online"
                    && host.providers().iter().any(|p| p == "docker") =>
            {
                agents.insert(host_ref.clone(), host);
            }
            _ => missing.push(host_ref.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(OrchestratorError::MissingHosts { hosts: missing });
    }

    let job_id = Uuid::new_v4().to_string();
    let first_agent_id = agents.values().next().map(|agent| agent.id.clone());
    st.jobs
        .create(&job_id, lab_id, first_agent_id.as_deref(), "deploy")
        .await?;
    st.labs.set_state(lab_id, "starting", None).await?;
    st.jobs.mark_running(&job_id).await?;

    let result = if analysis.single_host {
        deploy_single_host(st, lab_id, &job_id, &analysis, &agents, &nodes, &links).await
    } else {
        deploy_multi_host(st, lab_id, &job_id, &analysis, &agents, &nodes, &links).await
    };

    match result {
        Ok(DeployCompletion::Accepted) => {
            // Outcome arrives via the callback endpoints; the lab stays
            // `starting` until then.
            info!(lab_id = %lab_id, job_id = %job_id, "deploy accepted by agent");
            Ok(job_id)
        }
        Ok(DeployCompletion::Completed { log }) => {
            st.jobs.finish(&job_id, "completed", &log).await?;
            st.labs.set_state(lab_id, "running", None).await?;
            if let Some(agent_id) = &first_agent_id {
                st.labs.set_agent(lab_id, Some(agent_id)).await?;
            }
            record_placements(st, lab_id, &analysis, &agents).await?;
            info!(lab_id = %lab_id, job_id = %job_id, "lab deployed");
            Ok(job_id)
        }
        Err(err) => {
            let message = err.to_string();
            let _ = st.jobs.finish(&job_id, "failed", &message).await;
            let _ = st.labs.set_state(lab_id, "error", Some(&message)).await;
            error!(lab_id = %lab_id, job_id = %job_id, error = %message, "deploy failed");
            Err(err)
        }
    }
}

enum DeployCompletion {
    Completed { log: String },
    Accepted,
}

async fn deploy_single_host(
    st: &AppState,
    lab_id: &str,
    job_id: &str,
    analysis: &analyze::PlacementAnalysis,
    agents: &BTreeMap<String, HostRow>,
    nodes: &[crate::features::topology::repo::NodeRow],
    links: &[crate::features::topology::repo::LinkRow],
) -> Result<DeployCompletion, OrchestratorError> {
    let (host_ref, host_nodes) = analysis
        .placements
        .iter()
        .next()
        .ok_or_else(|| OrchestratorError::InvalidTopology("no placements".to_string()))?;
    let agent = &agents[host_ref];

    let topology_yaml = yaml::render_for_host(lab_id, nodes, links, host_nodes)
        .map_err(|err| OrchestratorError::Internal(err.to_string()))?;

    let callback_url = st
        .cfg
        .public_url
        .as_ref()
        .map(|base| format!("{}/callbacks/job/{job_id}", base.trim_end_matches('/')));

    let request = DeployRequest {
        job_id: job_id.to_string(),
        lab_id: lab_id.to_string(),
        topology_yaml,
        provider: Provider::Docker,
        callback_url,
    };

    let result = st
        .agent_client
        .deploy(&agent.address, &request)
        .await
        .map_err(classify_agent_error)?;

    match result.status {
        JobStatus::Accepted => Ok(DeployCompletion::Accepted),
        JobStatus::Completed => Ok(DeployCompletion::Completed {
            log: format!("{}\n{}", result.stdout, result.stderr),
        }),
        _ => Err(OrchestratorError::JobFailed {
            message: result
                .error_message
                .unwrap_or_else(|| format!("agent reported {:?}", result.status)),
        }),
    }
}

async fn deploy_multi_host(
    st: &AppState,
    lab_id: &str,
    job_id: &str,
    analysis: &analyze::PlacementAnalysis,
    agents: &BTreeMap<String, HostRow>,
    nodes: &[crate::features::topology::repo::NodeRow],
    links: &[crate::features::topology::repo::LinkRow],
) -> Result<DeployCompletion, OrchestratorError> {
    info!(
        lab_id = %lab_id,
        hosts = analysis.placements.len(),
        cross_links = analysis.cross_host_links.len(),
        "multi-host deploy"
    );

    let mut join_set: JoinSet<(String, Result<trellis_types::JobResult, AgentClientError>)> =
        JoinSet::new();

    for (host_ref, host_nodes) in &analysis.placements {
        let agent = &agents[host_ref];
        let topology_yaml = yaml::render_for_host(lab_id, nodes, links, host_nodes)
            .map_err(|err| OrchestratorError::Internal(err.to_string()))?;

        let request = DeployRequest {
            job_id: format!("{job_id}:{host_ref}"),
            lab_id: lab_id.to_string(),
            topology_yaml,
            provider: Provider::Docker,
            callback_url: None,
        };
        let client = st.agent_client.clone();
        let address = agent.address.clone();
        let host_ref = host_ref.clone();
        join_set.spawn(async move {
            let result = client.deploy(&address, &request).await;
            (host_ref, result)
        });
    }

    let mut log_lines = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let (host_ref, result) = joined.map_err(|err| OrchestratorError::Internal(err.to_string()))?;
        match result {
            Ok(job_result) if job_result.status == JobStatus::Completed => {
                log_lines.push(format!("[{host_ref}] {}", job_result.stdout));
            }
            Ok(job_result) => {
                failures.push(format!(
                    "[{host_ref}] {}",
                    job_result
                        .error_message
                        .unwrap_or_else(|| format!("status {:?}", job_result.status))
                ));
            }
            Err(err) => failures.push(format!("[{host_ref}] {err}")),
        }
    }

    if !failures.is_empty() {
        return Err(OrchestratorError::JobFailed {
            message: failures.join("; "),
        });
    }

    // Containers are up everywhere; now the cross-host links. These are
    // warnings on failure, never a deploy failure.
    for link in &analysis.cross_host_links {
        if let Err(err) = setup_cross_host_link(st, lab_id, link, agents).await {
            warn!(lab_id = %lab_id, link_id = %link.link_id, error = %err, "cross-host link setup failed");
            log_lines.push(format!("warning: link {} failed: {err}", link.link_id));
            let _ = st
                .jobs
                .append_log(job_id, &format!("\nwarning: link {} failed: {err}", link.link_id))
                .await;
        } else {
            log_lines.push(format!("link {} established", link.link_id));
        }
    }

    Ok(DeployCompletion::Completed {
        log: log_lines.join("\n"),
    })
}

/// Build both sides of a cross-host link with one shared VNI: tunnel on A
/// (allocates), tunnel on B (reuses), then attach each endpoint container.
async fn setup_cross_host_link(
    st: &AppState,
    lab_id: &str,
    link: &CrossHostLink,
    agents: &BTreeMap<String, HostRow>,
) -> Result<(), OrchestratorError> {
    let agent_a = agents
        .get(&link.host_a)
        .ok_or_else(|| OrchestratorError::Internal(format!("unknown host {}", link.host_a)))?;
    let agent_b = agents
        .get(&link.host_b)
        .ok_or_else(|| OrchestratorError::Internal(format!("unknown host {}", link.host_b)))?;

    if !agent_a.supports_vxlan() || !agent_b.supports_vxlan() {
        return Err(OrchestratorError::Internal(format!(
            "link {} requires vxlan support on both {} and {}",
            link.link_id, agent_a.id, agent_b.id
        )));
    }

    let ip_a = agent_ip(&agent_a.address);
    let ip_b = agent_ip(&agent_b.address);

    let tunnel_a = st
        .agent_client
        .create_tunnel(
            &agent_a.address,
            &CreateTunnelRequest {
                lab_id: lab_id.to_string(),
                link_id: link.link_id.clone(),
                local_ip: ip_a.clone(),
                remote_ip: ip_b.clone(),
                vni: None,
            },
        )
        .await
        .map_err(classify_agent_error)?;
    if !tunnel_a.success {
        return Err(OrchestratorError::Internal(
            tunnel_a.error.unwrap_or_else(|| "tunnel creation failed".to_string()),
        ));
    }
    let vni = tunnel_a.tunnel.as_ref().map(|t| t.vni);

    let tunnel_b = st
        .agent_client
        .create_tunnel(
            &agent_b.address,
            &CreateTunnelRequest {
                lab_id: lab_id.to_string(),
                link_id: link.link_id.clone(),
                local_ip: ip_b,
                remote_ip: ip_a,
                vni,
            },
        )
        .await
        .map_err(classify_agent_error)?;
    if !tunnel_b.success {
        // Half-built link: take down side A before reporting failure.
        let _ = st.agent_client.cleanup_overlay(&agent_a.address, lab_id).await;
        return Err(OrchestratorError::Internal(
            tunnel_b.error.unwrap_or_else(|| "tunnel creation failed".to_string()),
        ));
    }

    for (agent, node, interface, ip) in [
        (agent_a, &link.node_a, &link.interface_a, &link.ip_a),
        (agent_b, &link.node_b, &link.interface_b, &link.ip_b),
    ] {
        let attach = st
            .agent_client
            .attach_container(
                &agent.address,
                &AttachContainerRequest {
                    lab_id: lab_id.to_string(),
                    link_id: link.link_id.clone(),
                    container_name: container_name(lab_id, node),
                    interface_name: interface.clone(),
                    ip_address: ip.clone(),
                },
            )
            .await;
        match attach {
            Ok(response) if response.success => {}
            Ok(response) => warn!(
                link_id = %link.link_id,
                agent_id = %agent.id,
                error = ?response.error,
                "container attachment failed"
            ),
            Err(err) => warn!(
                link_id = %link.link_id,
                agent_id = %agent.id,
                error = %err,
                "container attachment failed"
            ),
        }
    }

    Ok(())
}

async fn record_placements(
    st: &AppState,
    lab_id: &str,
    analysis: &analyze::PlacementAnalysis,
    agents: &BTreeMap<String, HostRow>,
) -> Result<(), OrchestratorError> {
    for (host_ref, node_names) in &analysis.placements {
        let agent_id = &agents[host_ref].id;
        for node_name in node_names {
            st.topology
                .record_placement(lab_id, node_name, agent_id)
                .await?;
        }
    }
    Ok(())
}

pub async fn lab_down(st: &AppState, lab_id: &str) -> Result<String, OrchestratorError> {
    let lab = st.labs.get(lab_id).await?;
    st.labs.set_state(lab_id, "stopping", None).await?;

    // Every agent that might hold pieces of this lab: recorded placements
    // plus the lab's last-known agent.
    let placements = st.topology.placements(lab_id).await?;
    let mut agent_ids: Vec<String> = placements.into_iter().map(|p| p.host_id).collect();
    if let Some(agent_id) = &lab.agent_id {
        agent_ids.push(agent_id.clone());
    }
    agent_ids.sort();
    agent_ids.dedup();

    let job_id = Uuid::new_v4().to_string();
    st.jobs
        .create(&job_id, lab_id, agent_ids.first().map(String::as_str), "destroy")
        .await?;
    st.jobs.mark_running(&job_id).await?;

    let mut agents = Vec::new();
    for agent_id in &agent_ids {
        match st.hosts.get(agent_id).await {
            Ok(host) => agents.push(host),
            Err(sqlx::Error::RowNotFound) => {
                warn!(agent_id = %agent_id, "destroy references unknown agent")
            }
            Err(err) => return Err(err.into()),
        }
    }

    // Overlay first so the VXLAN mesh is gone before containers vanish.
    for agent in &agents {
        if let Err(err) = st.agent_client.cleanup_overlay(&agent.address, lab_id).await {
            warn!(agent_id = %agent.id, error = %err, "overlay cleanup failed");
        }
    }

    let mut join_set: JoinSet<(String, Result<trellis_types::JobResult, AgentClientError>)> =
        JoinSet::new();
    for agent in &agents {
        let request = DestroyRequest {
            job_id: format!("{job_id}:{}", agent.id),
            lab_id: lab_id.to_string(),
            provider: Provider::Docker,
            callback_url: None,
        };
        let client = st.agent_client.clone();
        let address = agent.address.clone();
        let agent_id = agent.id.clone();
        join_set.spawn(async move {
            let result = client.destroy(&address, &request).await;
            (agent_id, result)
        });
    }

    let mut log_lines = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let (agent_id, result) =
            joined.map_err(|err| OrchestratorError::Internal(err.to_string()))?;
        match result {
            Ok(job_result) if job_result.status == JobStatus::Completed => {
                log_lines.push(format!("[{agent_id}] {}", job_result.stdout));
            }
            Ok(job_result) => failures.push(format!(
                "[{agent_id}] {}",
                job_result.error_message.unwrap_or_default()
            )),
            Err(err) => failures.push(format!("[{agent_id}] {err}")),
        }
    }

    // Partial destroy failures are reported, but the lab still counts as
    // stopped: the reconciler's orphan sweep mops up leftovers.
    let status = if failures.is_empty() { "completed" } else { "failed" };
    let mut log = log_lines.join("\n");
    if !failures.is_empty() {
        log.push_str("\nfailures:\n");
        log.push_str(&failures.join("\n"));
    }
    st.jobs.finish(&job_id, status, &log).await?;
    st.labs.set_state(lab_id, "stopped", None).await?;
    st.topology.clear_placements(lab_id).await?;
    info!(lab_id = %lab_id, job_id = %job_id, failures = failures.len(), "lab destroyed");
    Ok(job_id)
}

fn classify_agent_error(err: AgentClientError) -> OrchestratorError {
    match err {
        AgentClientError::Unavailable(message) => OrchestratorError::AgentUnavailable(message),
        AgentClientError::Application { message, .. } => OrchestratorError::JobFailed { message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ip_strips_scheme_and_port() {
        assert_eq!(agent_ip("http://192.168.1.10:8001"), "192.168.1.10");
        assert_eq!(agent_ip("192.168.1.20:8001"), "192.168.1.20");
        assert_eq!(agent_ip("agent-b:8001"), "agent-b");
    }

    #[test]
    fn container_names_match_agent_side_naming() {
        assert_eq!(container_name("lab-1", "r1"), "trellis-lab-1-r1");
    }
}
