//! siftd server entrypoint.
//!
//! The heavy lifting (bootstrap, route wiring, graceful shutdown) lives in
//! dedicated modules so this file remains a thin orchestrator.

use anyhow::Result;
use clap::Parser;
use log::info;

use sift_server::{config, lifecycle, logging};

#[actix_web::main]
async fn main() -> Result<()> {
    let args = config::CliArgs::parse();

    let config = config::load(&args).map_err(|e| {
        eprintln!("Invalid configuration: {}", e);
        anyhow::anyhow!(e)
    })?;

    // logging before any other side effects
    logging::init_logging(
        &config.logging.level,
        &config.logging.file_path,
        config.logging.log_to_console,
    )?;

    info!("siftd v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "API: {}:{}  Peering: {}:{}",
        config.api.host, config.api.port, config.peering.host, config.peering.port
    );

    let components = lifecycle::bootstrap(&config).await?;
    lifecycle::run(&config, components).await
}
