//! Global constants for the santa-sleigh daemon.
//!
//! This module centralizes defaults and tuning values so the config layer,
//! the S3 backend and the shipping pipeline agree on them.

use std::time::Duration;

/// Build identifier printed by `--version`. Overridable at compile time
/// through the `SANTA_SLEIGH_BUILD` environment variable.
pub const VERSION: &str = match option_env!("SANTA_SLEIGH_BUILD") {
    Some(build) => build,
    None => env!("CARGO_PKG_VERSION"),
};

// Upload tuning defaults
/// Default number of files shipped concurrently in batch mode
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default delay between two pipeline runs
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Default number of attempts per S3 request
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Default suffix marking a claimed queue file
pub const DEFAULT_STAGING_SUFFIX: &str = ".partial";

/// Default tail-mode size threshold before a forced flush (10MB)
pub const DEFAULT_JSON_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Default tail-mode age threshold before a forced flush
pub const DEFAULT_JSON_MAX_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Cloud storage constants
/// S3 upload chunk size (8MB, S3 minimum is 5MB)
pub const S3_UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Large file threshold for multipart uploads (50MB)
pub const LARGE_FILE_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Base retry delay in milliseconds
pub const RETRY_BASE_DELAY_MS: u64 = 250;

/// Maximum retry delay in seconds
pub const RETRY_MAX_DELAY_SECS: u64 = 30;

// Filesystem layout
/// Timestamp format used for rotated tail chunks and archive collisions
pub const ROTATION_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Date partition format used in object keys
pub const KEY_DATE_FORMAT: &str = "%Y%m%d";

/// Suffix appended to compressed tail chunks
pub const JSON_CHUNK_EXTENSION: &str = ".json.gz";

/// Object name root used when the tailed file has no usable stem
pub const DEFAULT_CHUNK_NAME_ROOT: &str = "telemetry";

/// Hostname used when the OS refuses to tell us
pub const UNKNOWN_HOSTNAME: &str = "unknown";

/// Mode for files written by the cross-device fallback
#[cfg(unix)]
pub const ARCHIVE_FILE_MODE: u32 = 0o600;

/// Mode for the tailed input file when the daemon has to create it
#[cfg(unix)]
pub const TAIL_FILE_MODE: u32 = 0o640;

/// Mode for the daemon's own log file
#[cfg(unix)]
pub const LOG_FILE_MODE: u32 = 0o600;

// Platform default paths
#[cfg(target_os = "macos")]
pub const DEFAULT_CONFIG_PATH: &str = "/Library/Application Support/SantaSleigh/config.yaml";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_CONFIG_PATH: &str = "/etc/santa-sleigh/config.yaml";

#[cfg(target_os = "macos")]
pub const DEFAULT_QUEUE_DIR: &str = "/var/db/santa/spool";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_QUEUE_DIR: &str = "/var/log/pedro/spool";

#[cfg(target_os = "macos")]
pub const DEFAULT_JSON_INPUT_PATH: &str = "/var/db/santa/log.ndjson";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_JSON_INPUT_PATH: &str = "/var/log/pedro/log.ndjson";

#[cfg(target_os = "macos")]
pub const DEFAULT_LOG_FILE: &str = "/Library/Logs/SantaSleigh/santa-sleigh.log";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_LOG_FILE: &str = "/var/log/santa-sleigh/santa-sleigh.log";

// Credential environment variables
pub const ENV_ACCESS_KEY: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_REGION: &str = "AWS_REGION";
