//! Topology YAML parsing.
//!
//! Accepts both the wrapped (`{name, topology: {nodes, links}}`) and flat
//! (`{nodes, links}`) layouts, and the three link spellings that appear in
//! the wild: `{endpoints: [..]}` maps, bare lists, and
//! `"a:eth1 -- b:eth1"` strings.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde_yaml::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNode {
    pub name: String,
    pub kind: String,
    pub display_name: Option<String>,
    pub image: Option<String>,
    pub host: Option<String>,
    pub binds: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub startup_config: Option<String>,
}

impl TopologyNode {
    pub fn log_name(&self) -> String {
        match &self.display_name {
            Some(display) if display != &self.name => format!("{display}({})", self.name),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEndpoint {
    pub node: String,
    pub interface: String,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyLink {
    pub a: LinkEndpoint,
    pub b: LinkEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopology {
    pub name: String,
    pub nodes: BTreeMap<String, TopologyNode>,
    pub links: Vec<TopologyLink>,
}

impl ParsedTopology {
    pub fn log_name(&self, node_name: &str) -> String {
        self.nodes
            .get(node_name)
            .map(|node| node.log_name())
            .unwrap_or_else(|| node_name.to_string())
    }

    /// Highest interface index any link references per the whole topology,
    /// plus a small buffer for links added later. Never the vendor's full
    /// theoretical port count: a Docker network per port would exhaust the
    /// address space.
    pub fn required_interfaces(&self) -> u32 {
        let mut max_index = 0;
        for link in &self.links {
            for endpoint in [&link.a, &link.b] {
                if let Some(index) = trailing_index(&endpoint.interface) {
                    max_index = max_index.max(index);
                }
            }
        }
        (max_index + 4).max(4)
    }
}

fn trailing_index(interface: &str) -> Option<u32> {
    let digits: String = interface
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

pub fn parse_topology(topology_yaml: &str, lab_id: &str) -> Result<ParsedTopology> {
    let root: Value = serde_yaml::from_str(topology_yaml)?;

    let (name, nodes_value, links_value) = match root.get("topology") {
        Some(topology) => (
            root.get("name")
                .and_then(Value::as_str)
                .unwrap_or(lab_id)
                .to_string(),
            topology.get("nodes").cloned(),
            topology.get("links").cloned(),
        ),
        None => (
            lab_id.to_string(),
            root.get("nodes").cloned(),
            root.get("links").cloned(),
        ),
    };

    let mut nodes = BTreeMap::new();
    if let Some(Value::Mapping(raw_nodes)) = nodes_value {
        for (key, config) in raw_nodes {
            let Some(node_name) = key.as_str() else { continue };
            let Value::Mapping(_) = &config else { continue };
            nodes.insert(node_name.to_string(), parse_node(node_name, &config));
        }
    }

    let mut links = Vec::new();
    if let Some(Value::Sequence(raw_links)) = links_value {
        for (index, raw) in raw_links.iter().enumerate() {
            if let Some(link) = parse_link(raw, index) {
                links.push(link);
            }
        }
    }

    Ok(ParsedTopology { name, nodes, links })
}

fn parse_node(name: &str, config: &Value) -> TopologyNode {
    let str_of = |key: &str| config.get(key).and_then(Value::as_str).map(str::to_string);

    let binds = match config.get("binds") {
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    let env = match config.get("env") {
        Some(Value::Mapping(map)) => map
            .iter()
            .filter_map(|(k, v)| {
                let key = k.as_str()?.to_string();
                let value = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((key, value))
            })
            .collect(),
        _ => BTreeMap::new(),
    };

    TopologyNode {
        name: name.to_string(),
        kind: str_of("kind").unwrap_or_else(|| "linux".to_string()),
        display_name: str_of("_display_name"),
        image: str_of("image"),
        host: str_of("host"),
        binds,
        env,
        startup_config: str_of("startup-config"),
    }
}

fn parse_link(raw: &Value, index: usize) -> Option<TopologyLink> {
    let endpoints: Vec<String> = match raw {
        Value::Mapping(_) => match raw.get("endpoints") {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => return None,
        },
        Value::Sequence(seq) => seq
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Value::String(spec) => spec
            .replace("--", " ")
            .split_whitespace()
            .filter(|part| part.contains(':'))
            .map(str::to_string)
            .collect(),
        _ => return None,
    };

    if endpoints.len() < 2 {
        return None;
    }
    Some(TopologyLink {
        a: parse_endpoint(&endpoints[0], index),
        b: parse_endpoint(&endpoints[1], index),
    })
}

/// `node:iface` or `node:iface:ip`. A bare node name gets a positional
/// default interface.
fn parse_endpoint(spec: &str, link_index: usize) -> LinkEndpoint {
    let mut parts = spec.splitn(3, ':');
    let node = parts.next().unwrap_or_default().to_string();
    let interface = parts
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| format!("eth{}", link_index + 1));
    let ip = parts.next().map(str::to_string);
    LinkEndpoint { node, interface, ip }
}

/// Canonical link id: endpoints sorted so both sides derive the same name.
pub fn link_id(node_a: &str, iface_a: &str, node_b: &str, iface_b: &str) -> String {
    let ep_a = format!("{node_a}:{iface_a}");
    let ep_b = format!("{node_b}:{iface_b}");
    if ep_a <= ep_b {
        format!("{ep_a}-{ep_b}")
    } else {
        format!("{ep_b}-{ep_a}")
    }
}

/// Validate a topology has at least one node before any mutation happens.
pub fn require_nodes(topology: &ParsedTopology) -> Result<()> {
    if topology.nodes.is_empty() {
        bail!("no nodes found in topology");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRAPPED: &str = r#"
name: demo
topology:
  nodes:
    r1:
      kind: ceos
      image: ceos:4.28.0F
      env:
        EXTRA: "1"
    r2:
      kind: linux
  links:
    - endpoints: ["r1:eth1", "r2:eth1"]
"#;

    const FLAT: &str = r#"
nodes:
  a:
    kind: linux
    _display_name: Edge A
  b:
    kind: linux
links:
  - ["a:eth3", "b:eth1"]
  - "a:eth2 -- b:eth2"
"#;

    #[test]
    fn parses_wrapped_format() {
        let topo = parse_topology(WRAPPED, "lab-1").unwrap();
        assert_eq!(topo.name, "demo");
        assert_eq!(topo.nodes.len(), 2);
        assert_eq!(topo.nodes["r1"].kind, "ceos");
        assert_eq!(topo.nodes["r1"].env["EXTRA"], "1");
        assert_eq!(topo.links.len(), 1);
        assert_eq!(topo.links[0].a.node, "r1");
        assert_eq!(topo.links[0].b.interface, "eth1");
    }

    #[test]
    fn parses_flat_format_with_mixed_link_styles() {
        let topo = parse_topology(FLAT, "lab-2").unwrap();
        assert_eq!(topo.name, "lab-2");
        assert_eq!(topo.links.len(), 2);
        assert_eq!(topo.links[1].a.interface, "eth2");
        assert_eq!(topo.nodes["a"].log_name(), "Edge A(a)");
    }

    #[test]
    fn endpoint_ip_suffix_is_optional_metadata() {
        let ep = parse_endpoint("r1:eth1:10.0.0.1/30", 0);
        assert_eq!(ep.node, "r1");
        assert_eq!(ep.interface, "eth1");
        assert_eq!(ep.ip.as_deref(), Some("10.0.0.1/30"));
    }

    #[test]
    fn interface_budget_follows_max_link_index() {
        let topo = parse_topology(FLAT, "lab").unwrap();
        // Highest referenced index is eth3, plus the 4-slot buffer.
        assert_eq!(topo.required_interfaces(), 7);

        let empty = parse_topology("nodes: {}\nlinks: []\n", "lab").unwrap();
        assert_eq!(empty.required_interfaces(), 4);
    }

    #[test]
    fn link_ids_are_canonical() {
        assert_eq!(
            link_id("r2", "eth1", "r1", "eth1"),
            link_id("r1", "eth1", "r2", "eth1"),
        );
        assert_eq!(link_id("r1", "eth1", "r2", "eth1"), "r1:eth1-r2:eth1");
    }

    #[test]
    fn empty_topology_is_rejected() {
        let topo = parse_topology("nodes: {}\n", "lab").unwrap();
        assert!(require_nodes(&topo).is_err());
    }
}
