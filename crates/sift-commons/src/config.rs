//! Server configuration.
//!
//! Parsed from `server.toml`; every field has a default so a bare config
//! file (or none at all) yields a working single-node server.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Complete siftd server configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    /// HTTP API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Peering (consensus RPC) settings
    #[serde(default)]
    pub peering: PeeringConfig,

    /// Replication tuning
    #[serde(default)]
    pub raft: RaftConfig,

    /// On-disk paths
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cluster membership
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP API settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Number of HTTP worker threads; 0 = one per CPU.
    #[serde(default)]
    pub workers: usize,
}

/// Peering endpoint settings. The peering port carries consensus RPCs
/// between cluster members.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeeringConfig {
    #[serde(default = "default_peering_host")]
    pub host: String,

    #[serde(default = "default_peering_port")]
    pub port: u16,
}

/// Replication tuning knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaftConfig {
    /// Election timeout in milliseconds.
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Interval between periodic snapshots, in seconds.
    #[serde(default = "default_snapshot_interval_s")]
    pub snapshot_interval_s: u64,

    /// Upper bound on how long the apply loop waits for a dispatched
    /// mutation before poisoning the entry.
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// How often the nodes file is re-read for membership refresh.
    #[serde(default = "default_refresh_nodes_interval_s")]
    pub refresh_nodes_interval_s: u64,
}

/// On-disk layout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// State directory of the document store.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Root directory for consensus state (`log/`, `meta/`, `snapshot/`).
    #[serde(default = "default_raft_dir")]
    pub raft_dir: String,
}

/// Cluster membership settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Comma-separated `ip:peering_port:api_port` triples. Empty means a
    /// single-node cluster formed from the local identity.
    #[serde(default)]
    pub nodes: String,

    /// Path to a file whose contents are the nodes string; re-read
    /// periodically so membership can be refreshed without a restart.
    #[serde(default)]
    pub nodes_file: Option<String>,

    /// Snapshot an existing stand-alone store after the first leader
    /// election instead of starting from an empty one.
    #[serde(default)]
    pub create_init_db_snapshot: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path; empty disables file logging.
    #[serde(default)]
    pub file_path: String,

    #[serde(default = "default_log_to_console")]
    pub log_to_console: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            workers: 0,
        }
    }
}

impl Default for PeeringConfig {
    fn default() -> Self {
        Self {
            host: default_peering_host(),
            port: default_peering_port(),
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: default_election_timeout_ms(),
            snapshot_interval_s: default_snapshot_interval_s(),
            apply_timeout_ms: default_apply_timeout_ms(),
            refresh_nodes_interval_s: default_refresh_nodes_interval_s(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            raft_dir: default_raft_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_path: String::new(),
            log_to_console: default_log_to_console(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8108
}

fn default_peering_host() -> String {
    "127.0.0.1".to_string()
}

fn default_peering_port() -> u16 {
    7100
}

fn default_election_timeout_ms() -> u64 {
    2000
}

fn default_snapshot_interval_s() -> u64 {
    3600
}

fn default_apply_timeout_ms() -> u64 {
    60_000
}

fn default_refresh_nodes_interval_s() -> u64 {
    30
}

fn default_data_dir() -> String {
    "./data/state".to_string()
}

fn default_raft_dir() -> String {
    "./data/raft".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_to_console() -> bool {
    true
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read {}: {}", path.as_ref().display(), e))?;
        let config: ServerConfig =
            toml::from_str(&contents).map_err(|e| format!("Invalid configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.api.port == 0 {
            return Err("api.port must be > 0".to_string());
        }

        if self.peering.port == 0 {
            return Err("peering.port must be > 0".to_string());
        }

        if self.api.port == self.peering.port {
            return Err("api.port and peering.port must differ".to_string());
        }

        if self.raft.election_timeout_ms == 0 {
            return Err("raft.election_timeout_ms must be > 0".to_string());
        }

        if self.storage.data_dir == self.storage.raft_dir {
            return Err("storage.data_dir and storage.raft_dir must differ".to_string());
        }

        if !self.cluster.nodes.is_empty() {
            crate::cluster::parse_nodes(&self.cluster.nodes)
                .map_err(|e| format!("cluster.nodes: {}", e))?;
        }

        Ok(())
    }

    /// The nodes string to use at startup: the inline setting wins, then the
    /// nodes file, then empty (single-node).
    pub fn initial_nodes(&self) -> String {
        if !self.cluster.nodes.trim().is_empty() {
            return self.cluster.nodes.trim().to_string();
        }

        if let Some(path) = &self.cluster.nodes_file {
            match std::fs::read_to_string(path) {
                Ok(contents) => return contents.trim().to_string(),
                Err(_) => return String::new(),
            }
        }

        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.api.port, 8108);
        assert_eq!(config.peering.port, 7100);
    }

    #[test]
    fn parses_partial_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            [api]
            port = 9200

            [cluster]
            nodes = "127.0.0.1:7100:9200,127.0.0.2:7100:9201"
            "#,
        )
        .unwrap();

        assert_eq!(config.api.port, 9200);
        assert_eq!(config.peering.port, 7100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_port_collision() {
        let mut config = ServerConfig::default();
        config.peering.port = config.api.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_nodes() {
        let mut config = ServerConfig::default();
        config.cluster.nodes = "garbage".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn initial_nodes_prefers_inline_setting() {
        let mut config = ServerConfig::default();
        config.cluster.nodes = "127.0.0.1:7100:8108".to_string();
        config.cluster.nodes_file = Some("/nonexistent".to_string());
        assert_eq!(config.initial_nodes(), "127.0.0.1:7100:8108");
    }
}
