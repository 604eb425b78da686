use clap::Parser;
use std::path::PathBuf;

use crate::constants::VERSION;

/// Command-line arguments for the santa-sleigh daemon.
///
/// Everything except the config location lives in the YAML config file.
#[derive(Parser, Debug)]
#[clap(
    name = "santa-sleigh",
    about = "Ships spooled telemetry and tailed logs to S3",
    version = VERSION
)]
pub struct Args {
    /// Path to the daemon configuration file (default: platform-specific)
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,
}
