//! Daemon wiring: picks the batch or tail pipeline once at construction and
//! hands it to the scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::cloud::Uploader;
use crate::config::{DaemonConfig, UploadMode};
use crate::constants::VERSION;
use crate::shipper::claim::{recover_stale_claims, Disposal, RenameClaimManager};
use crate::shipper::key::{local_hostname, ObjectKeyBuilder};
use crate::shipper::scanner::scan_queue;
use crate::shipper::scheduler::{Cycle, Scheduler};
use crate::shipper::tail::{TailBuffer, TailOutcome};
use crate::shipper::worker::{BatchError, WorkerPool};

/// Process-wide values injected into the pipelines
#[derive(Clone)]
pub struct Context {
    pub hostname: String,
    pub clock: Arc<dyn Clock>,
}

impl Context {
    /// Real hostname and wall clock
    pub fn system() -> Self {
        Self {
            hostname: local_hostname(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Directory mode: scan, then ship the whole listing through the worker pool
pub struct BatchPipeline {
    queue: PathBuf,
    staging_suffix: Option<String>,
    pool: WorkerPool,
}

#[async_trait]
impl Cycle for BatchPipeline {
    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<()> {
        let entries = scan_queue(&self.queue, self.staging_suffix.as_deref()).await?;
        if entries.is_empty() {
            debug!("queue empty dir={}", self.queue.display());
            return Ok(());
        }

        match self.pool.run(entries, cancel).await {
            Ok(report) => {
                info!(
                    "cycle complete shipped={} failed=0 skipped={}",
                    report.shipped.len(),
                    report.skipped
                );
                Ok(())
            }
            Err(e) => {
                if let Some(batch) = e.downcast_ref::<BatchError>() {
                    info!("cycle complete shipped={} failed={}", batch.shipped, batch.len());
                }
                Err(e)
            }
        }
    }
}

/// Log mode: one threshold check per cycle
pub struct TailPipeline {
    buffer: TailBuffer,
}

#[async_trait]
impl Cycle for TailPipeline {
    async fn run_once(&mut self, _cancel: &CancellationToken) -> Result<()> {
        match self.buffer.check().await? {
            TailOutcome::Flushed { .. } | TailOutcome::Idle => {}
            outcome => debug!("tail check path={} outcome={:?}", self.buffer.path().display(), outcome),
        }
        Ok(())
    }
}

/// The operating mode, fixed for the process lifetime
pub enum Pipeline {
    Batch(BatchPipeline),
    Tail(TailPipeline),
}

#[async_trait]
impl Cycle for Pipeline {
    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self {
            Pipeline::Batch(batch) => batch.run_once(cancel).await,
            Pipeline::Tail(tail) => tail.run_once(cancel).await,
        }
    }
}

pub struct Daemon {
    config: DaemonConfig,
    pipeline: Pipeline,
    scheduler: Scheduler,
    hostname: String,
}

impl Daemon {
    pub fn new(config: DaemonConfig, uploader: Arc<dyn Uploader>, ctx: Context) -> Self {
        let upload = &config.upload;
        let keys = ObjectKeyBuilder::new(
            config.storage.key_prefix.as_deref(),
            &ctx.hostname,
            upload.key_layout,
        );

        let pipeline = match upload.mode {
            UploadMode::Parquet => {
                let disposal = match &upload.archive_dir {
                    Some(dir) => Disposal::Archive(dir.clone()),
                    None => Disposal::Delete,
                };
                let staging_suffix = upload.effective_staging_suffix().map(str::to_string);
                let claims = Arc::new(RenameClaimManager::new(
                    staging_suffix.as_deref(),
                    disposal,
                    Arc::clone(&ctx.clock),
                ));
                Pipeline::Batch(BatchPipeline {
                    queue: upload.queue_path(),
                    staging_suffix,
                    pool: WorkerPool::new(uploader, claims, keys, upload.concurrency),
                })
            }
            UploadMode::Json => {
                let buffer = TailBuffer::new(
                    upload.queue_path(),
                    upload.json_max_bytes,
                    upload.json_max_interval,
                    Arc::clone(&ctx.clock),
                    keys,
                    uploader,
                )
                .with_orphan_reship(upload.reship_orphans);
                Pipeline::Tail(TailPipeline { buffer })
            }
        };

        let scheduler = Scheduler::new(upload.poll_interval);
        Self {
            scheduler,
            pipeline,
            hostname: ctx.hostname,
            config,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Block until `cancel` fires. Fails only on startup errors.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let upload = &self.config.upload;
        info!(
            "starting santa-sleigh version={} mode={} queue={} hostname={}",
            VERSION,
            upload.mode,
            upload.queue_path().display(),
            self.hostname
        );

        self.ensure_directories().await?;

        if let Pipeline::Batch(batch) = &self.pipeline {
            if let Some(suffix) = batch.staging_suffix.as_deref() {
                match recover_stale_claims(&batch.queue, suffix).await {
                    Ok(0) => {}
                    Ok(n) => warn!("recovered stale claims count={}", n),
                    Err(e) => warn!("stale claim recovery failed error={:#}", e),
                }
            }
        }

        self.scheduler.run(&mut self.pipeline, &cancel).await?;
        info!("shutdown signal received");
        Ok(())
    }

    /// Create the queue directory (or the tailed file and its parent), the
    /// archive directory and the log directory
    pub async fn ensure_directories(&self) -> Result<()> {
        let upload = &self.config.upload;
        let queue = upload.queue_path();

        let mut dirs: Vec<PathBuf> = Vec::new();
        match upload.mode {
            UploadMode::Json => dirs.extend(queue.parent().map(Path::to_path_buf)),
            UploadMode::Parquet => {
                dirs.push(queue.clone());
                dirs.extend(upload.archive_dir.clone());
            }
        }
        dirs.extend(self.config.logging.file.parent().map(Path::to_path_buf));

        for dir in dirs.iter().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }

        if upload.mode == UploadMode::Json {
            let mut options = tokio::fs::OpenOptions::new();
            options.create(true).append(true);
            #[cfg(unix)]
            options.mode(crate::constants::TAIL_FILE_MODE);
            options
                .open(&queue)
                .await
                .with_context(|| format!("Failed to create json input file {}", queue.display()))?;
        }
        Ok(())
    }
}
