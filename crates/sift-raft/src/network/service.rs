//! Peering gRPC service.
//!
//! Handles incoming consensus RPCs from cluster peers.

use tonic::{Request, Response, Status};

use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};

use super::wire;
use crate::error::ReplicationError;
use crate::state_machine::ReplicationState;
use crate::storage::SiftTypeConfig;

/// Peering RPC request message
#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftRpcRequest {
    /// RPC type: "vote", "append_entries", "install_snapshot"
    #[prost(string, tag = "1")]
    pub rpc_type: String,

    /// Serialized RPC payload
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Peering RPC response message
#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftRpcResponse {
    /// Serialized response payload
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,

    /// Error message if any
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Generated gRPC client module
pub mod raft_client {
    use super::*;
    use tonic::codegen::*;

    /// Peering RPC client
    #[derive(Debug, Clone)]
    pub struct RaftClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl RaftClient<tonic::transport::Channel> {
        /// Create a new client from a channel
        pub fn new(channel: tonic::transport::Channel) -> Self {
            let inner = tonic::client::Grpc::new(channel);
            Self { inner }
        }
    }

    impl<T> RaftClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError> + std::fmt::Debug,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        /// Send a peering RPC
        pub async fn raft_rpc(
            &mut self,
            request: impl tonic::IntoRequest<RaftRpcRequest>,
        ) -> std::result::Result<tonic::Response<RaftRpcResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(tonic::Code::Unknown, format!("Service not ready: {:?}", e))
            })?;

            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/sift.raft.Raft/RaftRpc");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("sift.raft.Raft", "RaftRpc"));
            self.inner.unary(req, path, codec).await
        }
    }
}

/// Generated gRPC server module
pub mod raft_server {
    use super::*;
    use tonic::codegen::*;

    /// Peering service trait
    #[async_trait::async_trait]
    pub trait Raft: std::marker::Send + std::marker::Sync + 'static {
        /// Handle a peering RPC
        async fn raft_rpc(
            &self,
            request: tonic::Request<RaftRpcRequest>,
        ) -> std::result::Result<tonic::Response<RaftRpcResponse>, tonic::Status>;
    }

    /// Peering service server
    #[derive(Debug)]
    pub struct RaftServer<T: Raft> {
        inner: Arc<T>,
    }

    impl<T: Raft> RaftServer<T> {
        pub fn new(inner: T) -> Self {
            Self {
                inner: Arc::new(inner),
            }
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self { inner }
        }
    }

    impl<T: Raft> tonic::server::NamedService for RaftServer<T> {
        const NAME: &'static str = "sift.raft.Raft";
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for RaftServer<T>
    where
        T: Raft,
        B: Body + std::marker::Send + 'static,
        B::Error: Into<StdError> + std::marker::Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();

            match req.uri().path() {
                "/sift.raft.Raft/RaftRpc" => {
                    let fut = async move {
                        let mut grpc =
                            tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                        let method = RaftRpcSvc(inner);
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    let mut builder = http::Response::builder();
                    builder = builder.status(200).header("grpc-status", "12");
                    Ok(builder.body(tonic::body::empty_body()).unwrap())
                }),
            }
        }
    }

    struct RaftRpcSvc<T: Raft>(Arc<T>);

    impl<T: Raft> tonic::server::UnaryService<RaftRpcRequest> for RaftRpcSvc<T> {
        type Response = RaftRpcResponse;
        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

        fn call(&mut self, request: tonic::Request<RaftRpcRequest>) -> Self::Future {
            let inner = self.0.clone();
            let fut = async move { inner.raft_rpc(request).await };
            Box::pin(fut)
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

/// Peering gRPC service implementation
pub struct RaftService {
    state: Arc<ReplicationState>,
}

impl RaftService {
    pub fn new(state: Arc<ReplicationState>) -> Self {
        Self { state }
    }

    async fn handle(&self, rpc_type: &str, payload: &[u8]) -> Result<Vec<u8>, ReplicationError> {
        let node = self
            .state
            .raft_node()
            .ok_or_else(|| ReplicationError::node_init("consensus node not started"))?;

        match rpc_type {
            "vote" => {
                let rpc: VoteRequest<u64> = wire::deserialize(payload)?;
                let response = node
                    .vote(rpc)
                    .await
                    .map_err(|e| ReplicationError::Network(e.to_string()))?;
                wire::serialize(&response)
            }
            "append_entries" => {
                let rpc: AppendEntriesRequest<SiftTypeConfig> = wire::deserialize(payload)?;
                let response = node
                    .append_entries(rpc)
                    .await
                    .map_err(|e| ReplicationError::Network(e.to_string()))?;
                wire::serialize(&response)
            }
            "install_snapshot" => {
                let rpc: InstallSnapshotRequest<SiftTypeConfig> = wire::deserialize(payload)?;
                let response = node
                    .install_snapshot(rpc)
                    .await
                    .map_err(|e| ReplicationError::Network(e.to_string()))?;
                wire::serialize(&response)
            }
            other => Err(ReplicationError::Internal(format!(
                "Unknown RPC type: {}",
                other
            ))),
        }
    }
}

#[async_trait::async_trait]
impl raft_server::Raft for RaftService {
    async fn raft_rpc(
        &self,
        request: Request<RaftRpcRequest>,
    ) -> Result<Response<RaftRpcResponse>, Status> {
        let req = request.into_inner();

        match self.handle(&req.rpc_type, &req.payload).await {
            Ok(payload) => Ok(Response::new(RaftRpcResponse {
                payload,
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(RaftRpcResponse {
                payload: Vec::new(),
                error: e.to_string(),
            })),
        }
    }
}

/// Start the peering RPC server on a background task.
pub fn start_rpc_server(
    state: Arc<ReplicationState>,
    bind_addr: SocketAddr,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        log::info!("Peering RPC server listening on {}", bind_addr);
        let service = RaftService::new(state);
        let router =
            tonic::transport::Server::builder().add_service(raft_server::RaftServer::new(service));

        if let Err(e) = router.serve(bind_addr).await {
            log::error!("Peering RPC server failed: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_message_fields() {
        let req = RaftRpcRequest {
            rpc_type: "vote".to_string(),
            payload: vec![1, 2, 3],
        };

        assert_eq!(req.rpc_type, "vote");
        assert_eq!(req.payload, vec![1, 2, 3]);
    }
}
