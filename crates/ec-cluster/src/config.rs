//! Parses the plain-text cluster configuration file (§6) into an immutable
//! [`ClusterDirectory`].

use std::fs;
use std::path::Path;

use ec_types::{EcalError, NodeRole, MAX_NODES};
use tracing::{info, warn};

/// One line of the cluster config file: `id hostname primary-ip
/// transport-ip [role]`. The role column is an extension over the literal
/// §6 grammar (§4.2 SUPPLEMENT); when absent, the role is assigned by the
/// position/convention rule instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: u32,
    pub hostname: String,
    pub address: String,
    pub transport_address: String,
    pub role: NodeRole,
}

#[derive(Debug, Clone)]
pub struct ClusterDirectory {
    nodes: Vec<NodeInfo>,
    my_id: u32,
}

fn parse_role(token: &str) -> Option<NodeRole> {
    match token.to_ascii_lowercase().as_str() {
        "dms" | "directorymetaserver" => Some(NodeRole::DirectoryMetaServer),
        "fms" | "filemetaserver" => Some(NodeRole::FileMetaServer),
        "ds" | "dataserver" => Some(NodeRole::DataServer),
        "client" => Some(NodeRole::Client),
        _ => None,
    }
}

fn parse_line(line: &str) -> Result<NodeInfo, EcalError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 4 && tokens.len() != 5 {
        return Err(EcalError::Config(format!(
            "cluster config line must have 4 or 5 whitespace-delimited fields, got {}: {line:?}",
            tokens.len()
        )));
    }

    let id: u32 = tokens[0]
        .parse()
        .map_err(|_| EcalError::Config(format!("invalid node id {:?}", tokens[0])))?;

    let role = match tokens.get(4) {
        Some(raw) => parse_role(raw)
            .ok_or_else(|| EcalError::Config(format!("unknown role {raw:?} for node {id}")))?,
        None => NodeRole::by_convention(id),
    };

    Ok(NodeInfo {
        id,
        hostname: tokens[1].to_string(),
        address: tokens[2].to_string(),
        transport_address: tokens[3].to_string(),
        role,
    })
}

impl ClusterDirectory {
    /// Parse `contents` (the cluster config file body) and build the
    /// directory for the node identified by `my_id`. Fatal per §4.2 on a
    /// duplicate id or more than [`MAX_NODES`] entries.
    pub fn parse(contents: &str, my_id: u32) -> Result<Self, EcalError> {
        let mut nodes = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            nodes.push(parse_line(line)?);
        }

        if nodes.len() > MAX_NODES {
            return Err(EcalError::Config(format!(
                "cluster config lists {} nodes, exceeding MAX_NODES={MAX_NODES}",
                nodes.len()
            )));
        }

        let mut seen = std::collections::HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if !seen.insert(node.id) {
                return Err(EcalError::Config(format!("duplicate node id {}", node.id)));
            }
        }

        if !seen.contains(&my_id) {
            return Err(EcalError::Config(format!(
                "local node id {my_id} is not present in the cluster config"
            )));
        }

        info!(nodes = nodes.len(), my_id, "loaded cluster directory");
        Ok(Self { nodes, my_id })
    }

    pub fn from_file(path: &Path, my_id: u32) -> Result<Self, EcalError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents, my_id)
    }

    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn my_id(&self) -> u32 {
        self.my_id
    }

    pub fn myself(&self) -> &NodeInfo {
        self.by_id(self.my_id).expect("my_id was validated during parse")
    }

    pub fn by_id(&self, id: u32) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn by_hostname(&self, hostname: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }

    pub fn by_address(&self, address: &str) -> Option<&NodeInfo> {
        self.nodes
            .iter()
            .find(|n| n.address == address || n.transport_address == address)
    }
}

/// Best-effort discovery of the cluster config path: prefer a local
/// override, fall back to a fixed relative filename.
pub fn discover(override_path: Option<&Path>) -> std::path::PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }
    let local = std::path::PathBuf::from("cluster.conf");
    if !local.exists() {
        warn!("cluster.conf not found in working directory; pass --cluster-config explicitly");
    }
    local
}
