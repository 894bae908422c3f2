//! Cluster member identities.
//!
//! A siftd cluster is described by a comma-separated list of
//! `ip:peering_port:api_port` triples. The API port doubles as the node's
//! identifier within the consensus group, so it must be unique across the
//! cluster.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when a nodes string cannot be parsed.
#[derive(Debug, Error)]
pub enum ClusterParseError {
    #[error("Invalid node triple '{0}': expected ip:peering_port:api_port")]
    InvalidTriple(String),

    #[error("Invalid port in node triple '{0}'")]
    InvalidPort(String),

    #[error("Nodes configuration is empty")]
    Empty,

    #[error("Duplicate node id {0} in nodes configuration")]
    DuplicateNodeId(u64),
}

/// Identity of a single cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Host or IP the peering (consensus RPC) endpoint binds to.
    pub host: String,
    /// Port of the peering endpoint.
    pub peering_port: u16,
    /// Port of the HTTP API endpoint. Also the node id.
    pub api_port: u16,
}

impl NodeIdentity {
    pub fn new(host: impl Into<String>, peering_port: u16, api_port: u16) -> Self {
        Self {
            host: host.into(),
            peering_port,
            api_port,
        }
    }

    /// The node's identifier within the consensus group.
    pub fn node_id(&self) -> u64 {
        self.api_port as u64
    }

    /// Address of the consensus RPC endpoint, e.g. `127.0.0.1:7100`.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.peering_port)
    }

    /// Address of the HTTP API endpoint, e.g. `127.0.0.1:8108`.
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.host, self.api_port)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.peering_port, self.api_port)
    }
}

impl FromStr for NodeIdentity {
    type Err = ClusterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(ClusterParseError::InvalidTriple(s.to_string()));
        }

        let peering_port: u16 = parts[1]
            .parse()
            .map_err(|_| ClusterParseError::InvalidPort(s.to_string()))?;
        let api_port: u16 = parts[2]
            .parse()
            .map_err(|_| ClusterParseError::InvalidPort(s.to_string()))?;

        Ok(NodeIdentity::new(parts[0], peering_port, api_port))
    }
}

/// Parse a comma-separated nodes string into member identities.
///
/// Node ids (api ports) must be unique.
pub fn parse_nodes(nodes: &str) -> Result<Vec<NodeIdentity>, ClusterParseError> {
    let trimmed = nodes.trim();
    if trimmed.is_empty() {
        return Err(ClusterParseError::Empty);
    }

    let mut members = Vec::new();
    for triple in trimmed.split(',') {
        let member: NodeIdentity = triple.parse()?;
        if members
            .iter()
            .any(|m: &NodeIdentity| m.node_id() == member.node_id())
        {
            return Err(ClusterParseError::DuplicateNodeId(member.node_id()));
        }
        members.push(member);
    }

    Ok(members)
}

/// Compute the effective nodes configuration: when the operator supplies no
/// nodes string the local node alone forms the initial cluster.
pub fn effective_nodes_config(
    peering_host: &str,
    peering_port: u16,
    api_port: u16,
    nodes: &str,
) -> String {
    if nodes.trim().is_empty() {
        format!("{}:{}:{}", peering_host, peering_port, api_port)
    } else {
        nodes.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_triple() {
        let member: NodeIdentity = "127.0.0.1:7100:8108".parse().unwrap();
        assert_eq!(member.host, "127.0.0.1");
        assert_eq!(member.peering_port, 7100);
        assert_eq!(member.api_port, 8108);
        assert_eq!(member.node_id(), 8108);
        assert_eq!(member.rpc_addr(), "127.0.0.1:7100");
        assert_eq!(member.api_addr(), "127.0.0.1:8108");
    }

    #[test]
    fn parses_multi_node_list() {
        let members = parse_nodes("10.0.0.1:7100:8108,10.0.0.2:7100:8109,10.0.0.3:7100:8110")
            .expect("should parse");
        assert_eq!(members.len(), 3);
        assert_eq!(members[1].host, "10.0.0.2");
        assert_eq!(members[2].node_id(), 8110);
    }

    #[test]
    fn rejects_malformed_triples() {
        assert!(parse_nodes("127.0.0.1:7100").is_err());
        assert!(parse_nodes("127.0.0.1:abc:8108").is_err());
        assert!(parse_nodes("").is_err());
        assert!(parse_nodes(":::").is_err());
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let err = parse_nodes("a:7100:8108,b:7100:8108").unwrap_err();
        assert!(matches!(err, ClusterParseError::DuplicateNodeId(8108)));
    }

    #[test]
    fn empty_nodes_string_derives_singleton() {
        let conf = effective_nodes_config("192.168.1.5", 7100, 8108, "");
        assert_eq!(conf, "192.168.1.5:7100:8108");

        let conf = effective_nodes_config("192.168.1.5", 7100, 8108, "a:1:2,b:3:4");
        assert_eq!(conf, "a:1:2,b:3:4");
    }

    #[test]
    fn display_roundtrip() {
        let member = NodeIdentity::new("10.1.2.3", 7100, 8108);
        let parsed: NodeIdentity = member.to_string().parse().unwrap();
        assert_eq!(member, parsed);
    }
}
