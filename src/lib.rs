//! # santa-sleigh
//!
//! A telemetry shipping daemon. It watches a local spool written by an
//! endpoint collector and moves what it finds to S3 (or any S3-compatible
//! store), surviving restarts and partial failures.
//!
//! ## Modes
//!
//! - **parquet** (batch): every file in the queue directory is claimed by an
//!   atomic rename, uploaded, then deleted or archived. A failure renames the
//!   file back so the next cycle retries it.
//! - **json** (tail): a single NDJSON file is rotated once it crosses a size
//!   or age threshold, gzipped in memory and uploaded.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use santa_sleigh::cloud::S3Uploader;
//! use santa_sleigh::config::DaemonConfig;
//! use santa_sleigh::shipper::{Context, Daemon};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = DaemonConfig::load(None)?;
//! let uploader = S3Uploader::new(&config.storage, config.upload.max_retries)?;
//! let mut daemon = Daemon::new(config, Arc::new(uploader), Context::system());
//! daemon.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Object keys
//!
//! `[prefix/]hostname=<host>/date=<YYYYMMDD>/<file>` by default, or
//! `[prefix/]<file>` with `key_layout: flat`.

pub mod cli;
pub mod clock;
pub mod cloud;
pub mod config;
pub mod constants;
pub mod logging;
pub mod shipper;

#[cfg(test)]
pub mod test_utils;
