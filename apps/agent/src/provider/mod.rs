pub mod docker;
pub mod topology;
pub mod vendors;

use std::collections::HashMap;

use trellis_types::{NodeInfo, NodeStatus};

/// Outcome of a deploy. `stdout`/`stderr` become the job transcript; the
/// raw text is preserved so operators can debug from the job log.
#[derive(Debug, Default)]
pub struct DeployOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Default)]
pub struct DestroyOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct NodeActionOutcome {
    pub success: bool,
    pub node_name: String,
    pub new_status: Option<NodeStatus>,
    pub stdout: String,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct StatusOutcome {
    pub lab_exists: bool,
    pub nodes: Vec<NodeInfo>,
    pub error: Option<String>,
}

impl DeployOutcome {
    pub fn node_states(&self) -> HashMap<String, NodeStatus> {
        self.nodes
            .iter()
            .map(|node| (node.name.clone(), node.status))
            .collect()
    }
}
