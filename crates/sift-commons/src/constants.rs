//! On-disk and cluster naming constants shared across crates.

/// Name of the consensus group a siftd cluster forms. There is exactly one
/// group per cluster; all writes flow through it.
pub const CONSENSUS_GROUP: &str = "default_group";

/// Sub-directory of `raft_dir` reserved for the replicated log.
pub const LOG_DIR_NAME: &str = "log";

/// Sub-directory of `raft_dir` holding vote/commit metadata.
pub const META_DIR_NAME: &str = "meta";

/// Sub-directory of `raft_dir` holding persisted snapshots.
pub const SNAPSHOT_DIR_NAME: &str = "snapshot";

/// Directory name, inside a snapshot, of the checkpointed store files.
/// Every file of a snapshot manifest is registered as
/// `db_snapshot/<filename>`.
pub const DB_SNAPSHOT_NAME: &str = "db_snapshot";

/// Log payload that triggers a one-shot snapshot instead of a mutation.
/// Used to upgrade a previously stand-alone store into a replicated one.
pub const INIT_SNAPSHOT_SENTINEL: &[u8] = b"INIT_SNAPSHOT";
