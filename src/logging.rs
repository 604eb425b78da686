//! Logger setup: every record goes to stdout and to the configured log file.

use std::fs::{self, OpenOptions};

use anyhow::{Context, Result};
use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};

use crate::config::LoggingConfig;

/// Map a configured level name onto a filter, defaulting to `Info`
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// Install the global logger.
///
/// Creates the log directory if needed and appends to the log file.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = parse_level(&config.level);

    if let Some(parent) = config.file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(crate::constants::LOG_FILE_MODE);
    }
    let file = options
        .open(&config.file)
        .with_context(|| format!("Failed to open log file {}", config.file.display()))?;

    CombinedLogger::init(vec![
        TermLogger::new(level, Config::default(), TerminalMode::Stdout, ColorChoice::Auto),
        WriteLogger::new(level, Config::default(), file),
    ])
    .context("Failed to initialize logger")?;

    Ok(())
}
