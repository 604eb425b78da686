//! Bounded-concurrency shipping of queue files.
//!
//! Every file runs through claim -> stat -> open -> key -> upload -> finalize
//! in its own task. Failures are collected per file and returned together as a
//! [`BatchError`]; one bad file never stops its siblings.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::cloud::{UploadUnit, Uploader};
use crate::shipper::claim::{ClaimManager, ClaimToken};
use crate::shipper::key::ObjectKeyBuilder;
use crate::shipper::scanner::QueueEntry;

/// Step of the per-file protocol that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Claim,
    Stat,
    Open,
    Upload,
    /// Upload succeeded but delete/archive did not. The claim is kept.
    Finalize,
    /// The task died without reporting
    Task,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Claim => "claim",
            FailureStage::Stat => "stat",
            FailureStage::Open => "open",
            FailureStage::Upload => "upload",
            FailureStage::Finalize => "finalize",
            FailureStage::Task => "task",
        };
        f.write_str(name)
    }
}

/// One file that could not be shipped
#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub key: Option<String>,
    pub stage: FailureStage,
    pub error: anyhow::Error,
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed at {}", self.path.display(), self.stage)?;
        if let Some(key) = &self.key {
            write!(f, " (key {})", key)?;
        }
        write!(f, ": {:#}", self.error)
    }
}

/// Aggregate of every per-file failure in one batch
#[derive(Debug)]
pub struct BatchError {
    pub failures: Vec<FileFailure>,
    /// Files from the same batch that did ship
    pub shipped: usize,
}

impl BatchError {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} file(s) failed to ship", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// What happened to the files handed to one batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Keys written, in completion order
    pub shipped: Vec<String>,
    /// Files left untouched or released because of cancellation
    pub skipped: usize,
}

enum FileOutcome {
    Shipped(String),
    Skipped,
}

/// Everything a per-file task needs, shared across tasks
struct Shipper {
    uploader: Arc<dyn Uploader>,
    claims: Arc<dyn ClaimManager>,
    keys: ObjectKeyBuilder,
}

impl Shipper {
    async fn ship(&self, entry: QueueEntry, cancel: CancellationToken) -> Result<FileOutcome, FileFailure> {
        if cancel.is_cancelled() {
            return Ok(FileOutcome::Skipped);
        }

        let path = entry.path;
        let mut token = self.claims.claim(&path).await.map_err(|error| FileFailure {
            path: path.clone(),
            key: None,
            stage: FailureStage::Claim,
            error,
        })?;

        match self.upload_claimed(&token, &cancel).await {
            Ok(Some(key)) => match self.claims.finalize(token).await {
                Ok(()) => Ok(FileOutcome::Shipped(key)),
                Err(error) => Err(FileFailure {
                    path,
                    key: Some(key),
                    stage: FailureStage::Finalize,
                    error,
                }),
            },
            Ok(None) => {
                self.release(&mut token).await;
                Ok(FileOutcome::Skipped)
            }
            Err((stage, key, error)) => {
                self.release(&mut token).await;
                Err(FileFailure {
                    path,
                    key,
                    stage,
                    error,
                })
            }
        }
    }

    /// Returns the key on success, `None` if cancelled before uploading
    async fn upload_claimed(
        &self,
        token: &ClaimToken,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, (FailureStage, Option<String>, anyhow::Error)> {
        let staged = token.staged();
        let meta = tokio::fs::metadata(staged)
            .await
            .with_context(|| format!("Failed to stat {}", staged.display()))
            .map_err(|e| (FailureStage::Stat, None, e))?;
        let modified: DateTime<Utc> = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .with_context(|| format!("Failed to read mtime of {}", staged.display()))
            .map_err(|e| (FailureStage::Stat, None, e))?;

        let file = tokio::fs::File::open(staged)
            .await
            .with_context(|| format!("Failed to open {}", staged.display()))
            .map_err(|e| (FailureStage::Open, None, e))?;

        if cancel.is_cancelled() {
            debug!("cancelled before upload file={}", token.original().display());
            return Ok(None);
        }

        let name = token.file_name().map_err(|e| (FailureStage::Open, None, e))?;
        let key = self.keys.build(&name, modified);

        self.uploader
            .upload(UploadUnit::from_file(key.clone(), file, meta.len()))
            .await
            .map_err(|e| (FailureStage::Upload, Some(key.clone()), e))?;

        Ok(Some(key))
    }

    async fn release(&self, token: &mut ClaimToken) {
        if let Err(e) = self.claims.release(token).await {
            warn!(
                "failed to release claim file={} error={:#}",
                token.original().display(),
                e
            );
        }
    }
}

/// Ships a list of queue entries with at most `concurrency` uploads in flight
pub struct WorkerPool {
    shipper: Arc<Shipper>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(
        uploader: Arc<dyn Uploader>,
        claims: Arc<dyn ClaimManager>,
        keys: ObjectKeyBuilder,
        concurrency: usize,
    ) -> Self {
        Self {
            shipper: Arc::new(Shipper {
                uploader,
                claims,
                keys,
            }),
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Ship `entries` in order. Tasks are spawned as semaphore slots free up,
    /// so dispatch follows the list order. Once `cancel` fires no further file
    /// is claimed; tasks already running are awaited.
    ///
    /// Returns a [`BatchError`] (inside `anyhow::Error`) if any file failed.
    pub async fn run(&self, entries: Vec<QueueEntry>, cancel: &CancellationToken) -> Result<BatchReport> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut report = BatchReport::default();
        let mut tasks = Vec::with_capacity(entries.len());
        let total = entries.len();

        for entry in entries {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("cancellation received, stopping dispatch");
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|e| anyhow!("worker semaphore closed: {}", e))?
                }
            };

            debug!("dispatching file={}", entry.path.display());
            let path = entry.path.clone();
            let shipper = Arc::clone(&self.shipper);
            let cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                shipper.ship(entry, cancel).await
            });
            tasks.push((path, handle));
        }
        report.skipped += total - tasks.len();

        let (paths, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let mut failures = Vec::new();
        for (path, joined) in paths.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(FileOutcome::Shipped(key))) => {
                    info!("shipped file={} key={}", path.display(), key);
                    report.shipped.push(key);
                }
                Ok(Ok(FileOutcome::Skipped)) => report.skipped += 1,
                Ok(Err(failure)) => {
                    error!(
                        "ship failed file={} stage={} key={} error={:#}",
                        failure.path.display(),
                        failure.stage,
                        failure.key.as_deref().unwrap_or("-"),
                        failure.error
                    );
                    failures.push(failure);
                }
                Err(e) => {
                    error!("ship task aborted file={} error={}", path.display(), e);
                    failures.push(FileFailure {
                        path,
                        key: None,
                        stage: FailureStage::Task,
                        error: anyhow!(e),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(BatchError {
                failures,
                shipped: report.shipped.len(),
            }
            .into())
        }
    }
}
