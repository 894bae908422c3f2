//! Peering transport.
//!
//! Consensus RPCs between cluster members travel over a single gRPC unary
//! method: the payload is a flexbuffers-serialized openraft message and an
//! `rpc_type` string selects the handler. Hand-written prost messages keep
//! the build free of codegen.

pub mod raft_network;
pub mod service;
pub mod wire;

pub use raft_network::{SiftNetworkConnection, SiftNetworkFactory};
pub use service::{start_rpc_server, RaftService};
