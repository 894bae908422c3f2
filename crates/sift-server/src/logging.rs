//! Logging setup: colored console output plus an optional plain log file.

use colored::*;
use log::{Level, LevelFilter};

fn format_level_colored(level: Level) -> ColoredString {
    match level {
        Level::Error => format!("[{:5}]", level).bright_red().bold(),
        Level::Warn => format!("[{:5}]", level).bright_yellow().bold(),
        Level::Info => format!("[{:5}]", level).bright_green(),
        Level::Debug => format!("[{:5}]", level).bright_blue(),
        Level::Trace => format!("[{:5}]", level).bright_magenta(),
    }
}

fn parse_log_level(level: &str) -> Result<LevelFilter, String> {
    match level.to_lowercase().as_str() {
        "error" => Ok(LevelFilter::Error),
        "warn" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        other => Err(format!("Unknown log level: {}", other)),
    }
}

/// Initialize the global logger.
///
/// Console pattern (colored): `[timestamp] [LEVEL] module - message`
/// File pattern (plain): `[timestamp] [LEVEL] [module] - message`
pub fn init_logging(level: &str, file_path: &str, log_to_console: bool) -> anyhow::Result<()> {
    let level_filter = parse_log_level(level).map_err(|e| anyhow::anyhow!(e))?;

    let mut dispatch = fern::Dispatch::new()
        .level(level_filter)
        // quiet the HTTP stacks unless explicitly asked for
        .level_for("actix_server", LevelFilter::Warn)
        .level_for("hyper", LevelFilter::Warn)
        .level_for("h2", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn);

    if log_to_console {
        let console = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}] {} {} - {}",
                    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    format_level_colored(record.level()),
                    record.target(),
                    message
                ))
            })
            .chain(std::io::stdout());
        dispatch = dispatch.chain(console);
    }

    if !file_path.is_empty() {
        if let Some(parent) = std::path::Path::new(file_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}] [{:5}] [{}] - {}",
                    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(fern::log_file(file_path)?);
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}
