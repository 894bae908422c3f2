//! Replicated write path for siftd.
//!
//! Mutating HTTP requests are serialized into a consensus log, replicated to
//! every node of the cluster and applied deterministically, in log order,
//! against the local document store. Snapshots ship hard-linked checkpoints
//! of the store between peers.
//!
//! ## Key components
//!
//! - [`codec`]: the log payload codec ([`ReplicatedRequest`] in, bytes out)
//! - [`state_machine::ReplicationState`]: the consensus state machine:
//!   `start`, `write`, the apply rendezvous, membership refresh, liveness
//! - [`snapshot`]: checkpoint-based snapshot save/load
//! - [`storage`]: the combined raft storage (log, vote, snapshot glue)
//! - [`network`]: gRPC transport between peers
//!
//! Reads never pass through this crate: they go straight to the local store.

pub mod codec;
pub mod error;
pub mod network;
pub mod snapshot;
pub mod state_machine;
pub mod storage;

pub use codec::{ReplicatedRequest, StoredResponse, ROUTE_ALREADY_HANDLED};
pub use error::{ReplicationError, Result};
pub use state_machine::{
    ReplicationOptions, ReplicationState, ReplicationStatus, RouteParams, WriteContext,
    WriteRouter,
};
pub use storage::{SiftNode, SiftTypeConfig};
