//! Shared building blocks for siftd
//!
//! This crate holds the pieces every other siftd crate depends on:
//! server configuration, cluster member identities and the on-disk
//! naming constants used by the replication layer.

pub mod cluster;
pub mod config;
pub mod constants;

pub use cluster::{ClusterParseError, NodeIdentity};
pub use config::ServerConfig;
