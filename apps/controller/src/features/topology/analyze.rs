//! Placement analysis: which nodes land on which host, and which links span
//! hosts. Pure over loaded rows so the logic is testable without a database.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use super::repo::{LinkRow, NodeRow, PlacementRow};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CrossHostLink {
    pub link_id: String,
    pub node_a: String,
    pub interface_a: String,
    pub host_a: String,
    pub ip_a: Option<String>,
    pub node_b: String,
    pub interface_b: String,
    pub host_b: String,
    pub ip_b: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlacementAnalysis {
    /// host_id -> container names placed there
    pub placements: BTreeMap<String, Vec<String>>,
    pub cross_host_links: Vec<CrossHostLink>,
    pub single_host: bool,
    /// Nodes without any host assignment (explicit or default).
    pub unplaced: Vec<String>,
}

/// Canonical link name: endpoints sorted so the same link always derives the
/// same id regardless of endpoint order.
pub fn canonical_link_name(
    node_a: &str,
    iface_a: &str,
    node_b: &str,
    iface_b: &str,
) -> String {
    let ep_a = format!("{node_a}:{iface_a}");
    let ep_b = format!("{node_b}:{iface_b}");
    if ep_a <= ep_b {
        format!("{ep_a}-{ep_b}")
    } else {
        format!("{ep_b}-{ep_a}")
    }
}

/// Host resolution order per node: explicit `node.host_id`, then a runtime
/// placement record, then the caller-provided default.
pub fn analyze(
    nodes: &[NodeRow],
    links: &[LinkRow],
    placements: &[PlacementRow],
    default_host_id: Option<&str>,
) -> PlacementAnalysis {
    let placement_by_node: HashMap<&str, &str> = placements
        .iter()
        .map(|p| (p.node_name.as_str(), p.host_id.as_str()))
        .collect();

    let mut node_hosts: HashMap<&str, String> = HashMap::new();
    let mut node_names: HashMap<&str, &str> = HashMap::new();
    let mut unplaced = Vec::new();

    for node in nodes {
        node_names.insert(node.id.as_str(), node.container_name.as_str());
        let host = node
            .host_id
            .as_deref()
            .or_else(|| placement_by_node.get(node.container_name.as_str()).copied())
            .or(default_host_id);
        match host {
            Some(host) => {
                node_hosts.insert(node.id.as_str(), host.to_string());
            }
            None => unplaced.push(node.container_name.clone()),
        }
    }

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes {
        if let Some(host) = node_hosts.get(node.id.as_str()) {
            grouped
                .entry(host.clone())
                .or_default()
                .push(node.container_name.clone());
        }
    }

    let mut cross_host_links = Vec::new();
    for link in links {
        let (Some(host_a), Some(host_b)) = (
            node_hosts.get(link.source_node_id.as_str()),
            node_hosts.get(link.target_node_id.as_str()),
        ) else {
            continue;
        };
        if host_a == host_b {
            continue;
        }

        let node_a = node_names
            .get(link.source_node_id.as_str())
            .copied()
            .unwrap_or_default();
        let node_b = node_names
            .get(link.target_node_id.as_str())
            .copied()
            .unwrap_or_default();

        let (ip_a, ip_b) = link
            .config_json
            .as_ref()
            .map(|config| {
                (
                    config["ip_a"].as_str().map(str::to_string),
                    config["ip_b"].as_str().map(str::to_string),
                )
            })
            .unwrap_or((None, None));

        cross_host_links.push(CrossHostLink {
            link_id: canonical_link_name(
                node_a,
                &link.source_interface,
                node_b,
                &link.target_interface,
            ),
            node_a: node_a.to_string(),
            interface_a: link.source_interface.clone(),
            host_a: host_a.clone(),
            ip_a,
            node_b: node_b.to_string(),
            interface_b: link.target_interface.clone(),
            host_b: host_b.clone(),
            ip_b,
        });
    }

    let single_host = grouped.len() <= 1;
    PlacementAnalysis {
        placements: grouped,
        cross_host_links,
        single_host,
        unplaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, name: &str, host: Option<&str>) -> NodeRow {
        NodeRow {
            id: id.to_string(),
            lab_id: "lab".to_string(),
            container_name: name.to_string(),
            display_name: None,
            kind: "linux".to_string(),
            image: Some("alpine:3".to_string()),
            host_id: host.map(str::to_string),
            connection_type: None,
            parent_interface: None,
            vlan_id: None,
            bridge_name: None,
            config_json: None,
        }
    }

    fn link(id: &str, src: &str, dst: &str, config: Option<serde_json::Value>) -> LinkRow {
        LinkRow {
            id: id.to_string(),
            lab_id: "lab".to_string(),
            link_name: format!("{src}:eth1-{dst}:eth1"),
            source_node_id: src.to_string(),
            source_interface: "eth1".to_string(),
            target_node_id: dst.to_string(),
            target_interface: "eth1".to_string(),
            mtu: None,
            bandwidth: None,
            config_json: config,
        }
    }

    #[test]
    fn all_nodes_on_default_host_is_single_host() {
        let nodes = vec![node("n1", "r1", None), node("n2", "r2", None)];
        let links = vec![link("l1", "n1", "n2", None)];
        let analysis = analyze(&nodes, &links, &[], Some("agent-a"));

        assert!(analysis.single_host);
        assert!(analysis.cross_host_links.is_empty());
        assert_eq!(analysis.placements["agent-a"], vec!["r1", "r2"]);
        assert!(analysis.unplaced.is_empty());
    }

    #[test]
    fn split_placement_detects_cross_host_link() {
        let nodes = vec![
            node("n1", "r1", Some("agent-a")),
            node("n2", "r2", Some("agent-b")),
        ];
        let config = serde_json::json!({"ip_a": "10.0.0.1/30", "ip_b": "10.0.0.2/30"});
        let links = vec![link("l1", "n1", "n2", Some(config))];
        let analysis = analyze(&nodes, &links, &[], None);

        assert!(!analysis.single_host);
        assert_eq!(analysis.cross_host_links.len(), 1);
        let cross = &analysis.cross_host_links[0];
        assert_eq!(cross.link_id, "r1:eth1-r2:eth1");
        assert_eq!(cross.host_a, "agent-a");
        assert_eq!(cross.host_b, "agent-b");
        assert_eq!(cross.ip_a.as_deref(), Some("10.0.0.1/30"));
        assert_eq!(cross.ip_b.as_deref(), Some("10.0.0.2/30"));
    }

    #[test]
    fn runtime_placement_beats_default_but_not_explicit_host() {
        let nodes = vec![node("n1", "r1", Some("agent-a")), node("n2", "r2", None)];
        let placements = vec![PlacementRow {
            lab_id: "lab".to_string(),
            node_name: "r2".to_string(),
            host_id: "agent-b".to_string(),
        }];
        let analysis = analyze(&nodes, &[], &placements, Some("agent-c"));

        assert_eq!(analysis.placements["agent-a"], vec!["r1"]);
        assert_eq!(analysis.placements["agent-b"], vec!["r2"]);
    }

    #[test]
    fn nodes_without_any_host_are_reported_unplaced() {
        let nodes = vec![node("n1", "r1", None)];
        let analysis = analyze(&nodes, &[], &[], None);
        assert_eq!(analysis.unplaced, vec!["r1"]);
        assert!(analysis.placements.is_empty());
    }

    #[test]
    fn canonical_names_ignore_endpoint_order() {
        assert_eq!(
            canonical_link_name("r2", "eth1", "r1", "eth1"),
            canonical_link_name("r1", "eth1", "r2", "eth1"),
        );
    }
}
