//! Consensus storage: log, vote and snapshot glue.

mod raft_store;
mod types;

pub use raft_store::{
    SiftLogReader, SiftRaftStorage, SiftSnapshotBuilder, StorageAdaptor, StoredSnapshot,
};
pub use types::{SiftNode, SiftTypeConfig};
