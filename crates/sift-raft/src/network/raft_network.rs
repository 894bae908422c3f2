//! openraft network implementation over the peering gRPC channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tonic::transport::Channel;

use super::service::{raft_client::RaftClient, RaftRpcRequest};
use super::wire;
use crate::error::ReplicationError;
use crate::storage::{SiftNode, SiftTypeConfig};

/// Creates per-peer network connections, sharing one channel per address.
#[derive(Clone, Default)]
pub struct SiftNetworkFactory {
    channels: Arc<RwLock<HashMap<String, Channel>>>,
}

impl SiftNetworkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    async fn channel(&self, rpc_addr: &str) -> Result<Channel, ReplicationError> {
        if let Some(channel) = self.channels.read().get(rpc_addr) {
            return Ok(channel.clone());
        }

        let endpoint = format!("http://{}", rpc_addr);
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| ReplicationError::Network(format!("Invalid peer URI: {}", e)))?
            .connect_timeout(Duration::from_secs(5))
            .connect()
            .await
            .map_err(|e| {
                ReplicationError::Network(format!("Failed to connect to peer {}: {}", rpc_addr, e))
            })?;

        self.channels
            .write()
            .insert(rpc_addr.to_string(), channel.clone());
        Ok(channel)
    }

    fn evict(&self, rpc_addr: &str) {
        self.channels.write().remove(rpc_addr);
    }
}

impl RaftNetworkFactory<SiftTypeConfig> for SiftNetworkFactory {
    type Network = SiftNetworkConnection;

    async fn new_client(&mut self, target: u64, node: &SiftNode) -> Self::Network {
        SiftNetworkConnection {
            factory: self.clone(),
            target,
            node: node.clone(),
        }
    }
}

/// A connection to one peer.
pub struct SiftNetworkConnection {
    factory: SiftNetworkFactory,
    target: u64,
    node: SiftNode,
}

impl SiftNetworkConnection {
    async fn rpc<Req, Resp>(&self, rpc_type: &str, rpc: &Req) -> Result<Resp, ReplicationError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let channel = self.factory.channel(&self.node.rpc_addr).await?;
        let payload = wire::serialize(rpc)?;

        let mut client = RaftClient::new(channel);
        let response = client
            .raft_rpc(RaftRpcRequest {
                rpc_type: rpc_type.to_string(),
                payload,
            })
            .await
            .map_err(|e| {
                // a broken channel is re-established on the next call
                self.factory.evict(&self.node.rpc_addr);
                ReplicationError::Network(format!(
                    "gRPC {} to node {} failed: {}",
                    rpc_type, self.target, e
                ))
            })?
            .into_inner();

        if !response.error.is_empty() {
            return Err(ReplicationError::Network(response.error));
        }

        wire::deserialize(&response.payload)
    }
}

impl RaftNetwork<SiftTypeConfig> for SiftNetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<SiftTypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, SiftNode, RaftError<u64>>> {
        self.rpc("append_entries", &rpc)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<SiftTypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, SiftNode, RaftError<u64, InstallSnapshotError>>,
    > {
        self.rpc("install_snapshot", &rpc)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, SiftNode, RaftError<u64>>> {
        self.rpc("vote", &rpc)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }
}
