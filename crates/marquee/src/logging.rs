use anyhow::Result;
use std::fs::{self, File};
use std::path::Path;
use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Installs the global subscriber: an optional file layer plus an optional pretty stdout
/// layer, both filtered as `"{level},marquee={level}"`.
pub fn setup_global_logging(
    log_path: Option<&Path>,
    log_level: &tracing::Level,
    with_stdout: bool,
) -> Result<()> {
    let filter = format!("{},marquee={}", log_level.as_str(), log_level.as_str());

    let file_layer = match log_path {
        Some(log_path) => {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(log_path)?;
            let file_writer = std::sync::Mutex::new(file).with_max_level(tracing::Level::TRACE);
            Some(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_file(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(EnvFilter::builder().parse(&filter)?),
            )
        }
        None => None,
    };

    let stdout_layer = if with_stdout {
        Some(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_thread_ids(true)
                .with_target(true)
                .with_ansi(true)
                .pretty()
                .with_filter(EnvFilter::builder().parse(&filter)?),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Sets up logging from the `[logging]` section. The log file is `<log_dir>/<file_name>`.
pub fn init_from_config(config: &LoggingConfig, file_name: &str) -> Result<()> {
    let level = parse_level(&config.level)?;
    let path = config.log_dir.as_ref().map(|dir| dir.join(file_name));
    setup_global_logging(path.as_deref(), &level, config.stdout)
}

pub fn parse_level(level: &str) -> Result<tracing::Level> {
    tracing::Level::from_str(level).map_err(|_| anyhow::anyhow!("Unknown log level '{}'", level))
}
