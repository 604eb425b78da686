//! Continuous log mode.
//!
//! The collector appends NDJSON to one live file. Each check decides whether
//! the file is due (size or age threshold), rotates it to
//! `<name>.<YYYYMMDDTHHMMSSZ>`, gzips the chunk in memory and uploads it. The
//! rotated chunk is deleted only after a successful upload; on failure it is
//! left next to the live file.
//!
//! The last-flush time lives in memory only and restarts at "now" when the
//! daemon starts.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_compression::tokio::write::GzipEncoder;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;

use crate::clock::Clock;
use crate::cloud::{UploadUnit, Uploader};
use crate::constants::{DEFAULT_CHUNK_NAME_ROOT, JSON_CHUNK_EXTENSION, ROTATION_TIMESTAMP_FORMAT};
use crate::shipper::key::ObjectKeyBuilder;

/// Result of one tail check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailOutcome {
    /// Below both thresholds, or nothing to ship
    Idle,
    /// The live file does not exist
    Missing,
    /// The live file disappeared between the size check and the rotation
    Vanished,
    /// Rotation produced an empty chunk, which was removed
    Empty,
    Flushed {
        key: String,
        raw_bytes: usize,
        compressed_bytes: usize,
    },
}

/// gzip `data` in memory
pub async fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzipEncoder::new(Vec::with_capacity(data.len() / 4 + 64));
    encoder.write_all(data).await.context("Failed to compress json payload")?;
    encoder.shutdown().await.context("Failed to finalise compression")?;
    Ok(encoder.into_inner())
}

/// Name root for chunk objects: `log.ndjson` -> `log`
fn chunk_name_root(live: &Path) -> String {
    let base = live
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let root = match base.rsplit_once('.') {
        Some((root, _)) => root.to_string(),
        None => base,
    };
    if root.is_empty() {
        DEFAULT_CHUNK_NAME_ROOT.to_string()
    } else {
        root
    }
}

pub struct TailBuffer {
    path: PathBuf,
    max_bytes: u64,
    max_interval: Duration,
    last_flush: DateTime<Utc>,
    reship_enabled: bool,
    clock: Arc<dyn Clock>,
    keys: ObjectKeyBuilder,
    uploader: Arc<dyn Uploader>,
}

impl TailBuffer {
    pub fn new(
        path: PathBuf,
        max_bytes: u64,
        max_interval: Duration,
        clock: Arc<dyn Clock>,
        keys: ObjectKeyBuilder,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        let last_flush = clock.now();
        Self {
            path,
            max_bytes,
            max_interval,
            last_flush,
            reship_enabled: false,
            clock,
            keys,
            uploader,
        }
    }

    /// Re-upload rotated chunks left behind by failed flushes on every check
    pub fn with_orphan_reship(mut self, enabled: bool) -> Self {
        self.reship_enabled = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_flush(&self) -> DateTime<Utc> {
        self.last_flush
    }

    fn rotated_path(&self, now: DateTime<Utc>) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}", now.format(ROTATION_TIMESTAMP_FORMAT)));
        self.path.with_file_name(name)
    }

    fn object_name(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}-{}{}",
            chunk_name_root(&self.path),
            at.format(ROTATION_TIMESTAMP_FORMAT),
            JSON_CHUNK_EXTENSION
        )
    }

    fn is_due(&self, size: u64, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.last_flush).to_std().unwrap_or(Duration::ZERO);
        size >= self.max_bytes || elapsed >= self.max_interval
    }

    /// Run one threshold check and, if due, rotate and ship the live file
    pub async fn check(&mut self) -> Result<TailOutcome> {
        if self.reship_enabled {
            match self.reship_orphans().await {
                Ok(0) => {}
                Ok(n) => info!("reshipped orphaned chunks count={}", n),
                Err(e) => warn!("orphan reship failed path={} error={:#}", self.path.display(), e),
            }
        }

        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(TailOutcome::Missing),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat json input {}", self.path.display()))
            }
        };
        if size == 0 {
            return Ok(TailOutcome::Idle);
        }

        let now = self.clock.now();
        if !self.is_due(size, now) {
            return Ok(TailOutcome::Idle);
        }

        let rotated = self.rotated_path(now);
        if tokio::fs::try_exists(&rotated).await.unwrap_or(false) {
            anyhow::bail!("Failed to rotate json input: chunk {} already exists", rotated.display());
        }
        match tokio::fs::rename(&self.path, &rotated).await {
            Ok(()) => debug!("rotated json input path={} chunk={}", self.path.display(), rotated.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(TailOutcome::Vanished),
            Err(e) => return Err(e).context("Failed to rotate json input"),
        }

        let data = tokio::fs::read(&rotated)
            .await
            .with_context(|| format!("Failed to read rotated json input {}", rotated.display()))?;
        if data.is_empty() {
            if let Err(e) = tokio::fs::remove_file(&rotated).await {
                warn!("remove empty chunk path={} error={}", rotated.display(), e);
            }
            return Ok(TailOutcome::Empty);
        }

        let compressed = gzip(&data).await?;
        let key = self.keys.build(&self.object_name(now), now);
        let compressed_bytes = compressed.len();
        self.uploader
            .upload(UploadUnit::from_bytes(key.clone(), compressed))
            .await
            .with_context(|| format!("Failed to upload json payload chunk={}", rotated.display()))?;
        self.last_flush = now;

        if let Err(e) = tokio::fs::remove_file(&rotated).await {
            if e.kind() != ErrorKind::NotFound {
                warn!("remove rotated json input path={} error={}", rotated.display(), e);
            }
        }

        info!(
            "uploaded json chunk key={} raw_bytes={} compressed_bytes={}",
            key,
            data.len(),
            compressed_bytes
        );
        Ok(TailOutcome::Flushed {
            key,
            raw_bytes: data.len(),
            compressed_bytes,
        })
    }

    /// Rotated chunks sitting next to the live file, oldest first, with the
    /// timestamp parsed from their name
    async fn find_orphans(&self) -> Result<Vec<(PathBuf, DateTime<Utc>)>> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let base = match self.path.file_name() {
            Some(base) => format!("{}.", base.to_string_lossy()),
            None => return Ok(Vec::new()),
        };

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read dir {}", dir.display()))?;
        let mut orphans = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stamp = match name.strip_prefix(&base) {
                Some(stamp) => stamp,
                None => continue,
            };
            if let Ok(at) = NaiveDateTime::parse_from_str(stamp, ROTATION_TIMESTAMP_FORMAT) {
                orphans.push((entry.path(), at.and_utc()));
            }
        }
        orphans.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(orphans)
    }

    /// Upload chunks left on disk by earlier failed flushes. The key reuses
    /// the chunk's own timestamp, so a retry lands on the key the failed flush
    /// would have written. Returns how many were shipped.
    pub async fn reship_orphans(&self) -> Result<usize> {
        let mut shipped = 0;
        for (chunk, at) in self.find_orphans().await? {
            let data = match tokio::fs::read(&chunk).await {
                Ok(data) => data,
                Err(e) => {
                    warn!("read orphaned chunk path={} error={}", chunk.display(), e);
                    continue;
                }
            };
            if data.is_empty() {
                if let Err(e) = tokio::fs::remove_file(&chunk).await {
                    warn!("remove empty orphaned chunk path={} error={}", chunk.display(), e);
                }
                continue;
            }

            let key = self.keys.build(&self.object_name(at), at);
            let compressed = gzip(&data).await?;
            match self.uploader.upload(UploadUnit::from_bytes(key.clone(), compressed)).await {
                Ok(()) => {
                    info!("reshipped orphaned chunk path={} key={}", chunk.display(), key);
                    if let Err(e) = tokio::fs::remove_file(&chunk).await {
                        warn!("remove orphaned chunk path={} error={}", chunk.display(), e);
                    }
                    shipped += 1;
                }
                Err(e) => warn!(
                    "orphaned chunk upload failed path={} key={} error={:#}",
                    chunk.display(),
                    key,
                    e
                ),
            }
        }
        Ok(shipped)
    }
}
