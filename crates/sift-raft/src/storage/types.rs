//! Consensus type configuration.

use std::io::Cursor;

use openraft::{Entry, RaftTypeConfig};
use serde::{Deserialize, Serialize};

use sift_commons::NodeIdentity;

/// Type configuration for siftd's consensus group.
///
/// Log entries and responses are opaque byte strings: the request codec is
/// the only party that interprets them.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SiftTypeConfig;

impl RaftTypeConfig for SiftTypeConfig {
    type D = Vec<u8>;
    type R = Vec<u8>;
    type NodeId = u64;
    type Node = SiftNode;
    type Entry = Entry<Self>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<Self>;
}

/// Addresses of a cluster member, as stored in the membership config.
///
/// `rpc_addr` carries consensus RPCs (the peering endpoint); `api_addr` is
/// the HTTP API clients and the leader forwarder talk to. The node id is
/// the API port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SiftNode {
    pub rpc_addr: String,
    pub api_addr: String,
}

impl SiftNode {
    pub fn new(rpc_addr: impl Into<String>, api_addr: impl Into<String>) -> Self {
        Self {
            rpc_addr: rpc_addr.into(),
            api_addr: api_addr.into(),
        }
    }
}

impl From<&NodeIdentity> for SiftNode {
    fn from(identity: &NodeIdentity) -> Self {
        Self::new(identity.rpc_addr(), identity.api_addr())
    }
}

impl std::fmt::Display for SiftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.rpc_addr, self.api_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_identity() {
        let identity = NodeIdentity::new("10.0.0.7", 7100, 8108);
        let node = SiftNode::from(&identity);
        assert_eq!(node.rpc_addr, "10.0.0.7:7100");
        assert_eq!(node.api_addr, "10.0.0.7:8108");
        assert_eq!(format!("{}", node), "10.0.0.7:7100|10.0.0.7:8108");
    }
}
