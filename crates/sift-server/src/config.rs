//! Configuration loading: TOML file with command-line overrides.

use clap::Parser;

use sift_commons::ServerConfig;

/// siftd, a clustered search service
#[derive(Debug, Parser)]
#[command(name = "siftd", version, about)]
pub struct CliArgs {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "server.toml")]
    pub config: String,

    /// HTTP API port
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Peering (consensus RPC) port
    #[arg(long)]
    pub peering_port: Option<u16>,

    /// Peering host/IP advertised to the cluster
    #[arg(long)]
    pub peering_address: Option<String>,

    /// Comma-separated ip:peering_port:api_port triples, or @path to a
    /// file containing them
    #[arg(long)]
    pub nodes: Option<String>,

    /// Document store state directory
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Consensus state directory
    #[arg(long)]
    pub raft_dir: Option<String>,

    /// Snapshot an existing stand-alone store after leader election
    #[arg(long)]
    pub create_init_db_snapshot: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Load the config file (defaults when absent) and apply CLI overrides.
pub fn load(args: &CliArgs) -> Result<ServerConfig, String> {
    let mut config = if std::path::Path::new(&args.config).exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };

    if let Some(port) = args.api_port {
        config.api.port = port;
    }
    if let Some(port) = args.peering_port {
        config.peering.port = port;
    }
    if let Some(host) = &args.peering_address {
        config.peering.host = host.clone();
    }
    if let Some(nodes) = &args.nodes {
        if let Some(path) = nodes.strip_prefix('@') {
            config.cluster.nodes_file = Some(path.to_string());
        } else {
            config.cluster.nodes = nodes.clone();
        }
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(dir) = &args.raft_dir {
        config.storage.raft_dir = dir.clone();
    }
    if args.create_init_db_snapshot {
        config.cluster.create_init_db_snapshot = true;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_take_precedence() {
        let args = CliArgs::parse_from([
            "siftd",
            "--config",
            "/nonexistent.toml",
            "--api-port",
            "9200",
            "--nodes",
            "127.0.0.1:7100:9200",
        ]);

        let config = load(&args).unwrap();
        assert_eq!(config.api.port, 9200);
        assert_eq!(config.cluster.nodes, "127.0.0.1:7100:9200");
    }

    #[test]
    fn nodes_file_syntax() {
        let args = CliArgs::parse_from(["siftd", "--nodes", "@/etc/siftd/nodes"]);
        let config = load(&args).unwrap();
        assert!(config.cluster.nodes.is_empty());
        assert_eq!(config.cluster.nodes_file.as_deref(), Some("/etc/siftd/nodes"));
    }
}
