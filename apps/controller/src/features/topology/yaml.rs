//! Topology YAML rendering for agents.
//!
//! Multi-host deploys send each agent only its slice: the nodes placed
//! there, plus the links whose two endpoints are both local. Cross-host
//! links are wired afterwards through the overlay path, so the local side's
//! interface is simply left unconnected here.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use super::repo::{LinkRow, NodeRow};

#[derive(Debug, Serialize)]
struct YamlNode {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(rename = "_display_name", skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct YamlLink {
    endpoints: [String; 2],
}

#[derive(Debug, Serialize)]
struct YamlTopology {
    nodes: BTreeMap<String, YamlNode>,
    links: Vec<YamlLink>,
}

#[derive(Debug, Serialize)]
struct YamlRoot {
    name: String,
    topology: YamlTopology,
}

/// Render the sub-topology for one host. `host_nodes` holds the container
/// names placed on that host.
pub fn render_for_host(
    lab_id: &str,
    nodes: &[NodeRow],
    links: &[LinkRow],
    host_nodes: &[String],
) -> anyhow::Result<String> {
    let local: HashSet<&str> = host_nodes.iter().map(String::as_str).collect();
    let name_by_id: BTreeMap<&str, &str> = nodes
        .iter()
        .map(|node| (node.id.as_str(), node.container_name.as_str()))
        .collect();

    let yaml_nodes: BTreeMap<String, YamlNode> = nodes
        .iter()
        .filter(|node| local.contains(node.container_name.as_str()))
        .map(|node| {
            (
                node.container_name.clone(),
                YamlNode {
                    kind: node.kind.clone(),
                    image: node.image.clone(),
                    display_name: node.display_name.clone(),
                },
            )
        })
        .collect();

    let yaml_links: Vec<YamlLink> = links
        .iter()
        .filter_map(|link| {
            let src = name_by_id.get(link.source_node_id.as_str())?;
            let dst = name_by_id.get(link.target_node_id.as_str())?;
            if !local.contains(src) || !local.contains(dst) {
                return None;
            }
            Some(YamlLink {
                endpoints: [
                    format!("{src}:{}", link.source_interface),
                    format!("{dst}:{}", link.target_interface),
                ],
            })
        })
        .collect();

    let root = YamlRoot {
        name: lab_id.to_string(),
        topology: YamlTopology {
            nodes: yaml_nodes,
            links: yaml_links,
        },
    };
    Ok(serde_yaml::to_string(&root)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, name: &str, kind: &str) -> NodeRow {
        NodeRow {
            id: id.to_string(),
            lab_id: "lab".to_string(),
            container_name: name.to_string(),
            display_name: None,
            kind: kind.to_string(),
            image: Some("alpine:3".to_string()),
            host_id: None,
            connection_type: None,
            parent_interface: None,
            vlan_id: None,
            bridge_name: None,
            config_json: None,
        }
    }

    fn link(src_id: &str, dst_id: &str) -> LinkRow {
        LinkRow {
            id: format!("{src_id}-{dst_id}"),
            lab_id: "lab".to_string(),
            link_name: String::new(),
            source_node_id: src_id.to_string(),
            source_interface: "eth1".to_string(),
            target_node_id: dst_id.to_string(),
            target_interface: "eth1".to_string(),
            mtu: None,
            bandwidth: None,
            config_json: None,
        }
    }

    #[test]
    fn renders_only_local_nodes_and_fully_local_links() {
        let nodes = vec![node("n1", "r1", "linux"), node("n2", "r2", "linux"), node("n3", "r3", "ceos")];
        let links = vec![link("n1", "n2"), link("n2", "n3")];
        let host_nodes = vec!["r1".to_string(), "r2".to_string()];

        let yaml = render_for_host("lab-1", &nodes, &links, &host_nodes).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        let rendered_nodes = parsed["topology"]["nodes"].as_mapping().unwrap();
        assert_eq!(rendered_nodes.len(), 2);
        assert!(rendered_nodes.contains_key("r1"));
        assert!(!rendered_nodes.contains_key("r3"));

        // The r2--r3 link crosses hosts, so only r1--r2 survives.
        let rendered_links = parsed["topology"]["links"].as_sequence().unwrap();
        assert_eq!(rendered_links.len(), 1);
        assert_eq!(
            rendered_links[0]["endpoints"][0].as_str().unwrap(),
            "r1:eth1"
        );
    }

    #[test]
    fn round_trips_through_the_agent_parser_shape() {
        let nodes = vec![node("n1", "r1", "linux")];
        let yaml = render_for_host("lab-x", &nodes, &[], &["r1".to_string()]).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["name"].as_str().unwrap(), "lab-x");
        assert_eq!(
            parsed["topology"]["nodes"]["r1"]["kind"].as_str().unwrap(),
            "linux"
        );
    }
}
