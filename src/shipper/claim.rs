//! Exclusive claims over queue files.
//!
//! A claim is an atomic rename of `path` to `path + suffix`. The scanner skips
//! suffixed names, so while a file is staged no other worker in this process
//! can see it. Releasing renames it back; finalizing deletes or archives it.
//! Exclusion only holds within one daemon process on one filesystem.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};

use crate::clock::Clock;
use crate::shipper::mover::archive_file;

/// Terminal success action for a claimed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposal {
    Delete,
    Archive(PathBuf),
}

/// Exclusive ownership of one queue file
#[derive(Debug)]
pub struct ClaimToken {
    original: PathBuf,
    staged: PathBuf,
    exclusive: bool,
    released: bool,
}

impl ClaimToken {
    pub fn original(&self) -> &Path {
        &self.original
    }

    /// Path to read the claimed content from
    pub fn staged(&self) -> &Path {
        &self.staged
    }

    /// Whether the claim is backed by a rename (claiming enabled)
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Original file name, used for keys and archive names
    pub fn file_name(&self) -> Result<String> {
        self.original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("claimed path has no file name: {}", self.original.display()))
    }
}

/// claim / release / finalize over queue files.
///
/// The worker pool only depends on this trait so the rename-based
/// implementation can be swapped for a lease-backed one.
#[async_trait]
pub trait ClaimManager: Send + Sync {
    /// Take exclusive ownership of `path`
    async fn claim(&self, path: &Path) -> Result<ClaimToken>;

    /// Give the file back under its original name. Idempotent.
    async fn release(&self, token: &mut ClaimToken) -> Result<()>;

    /// Delete or archive the claimed file after a successful upload
    async fn finalize(&self, token: ClaimToken) -> Result<()>;
}

/// Claim manager built on atomic filesystem renames
pub struct RenameClaimManager {
    staging_suffix: Option<String>,
    disposal: Disposal,
    clock: Arc<dyn Clock>,
}

impl RenameClaimManager {
    /// `staging_suffix` of `None` (or empty) disables claiming: files are
    /// processed in place and release is a no-op.
    pub fn new(staging_suffix: Option<&str>, disposal: Disposal, clock: Arc<dyn Clock>) -> Self {
        Self {
            staging_suffix: staging_suffix.filter(|s| !s.is_empty()).map(str::to_string),
            disposal,
            clock,
        }
    }

    pub fn staging_suffix(&self) -> Option<&str> {
        self.staging_suffix.as_deref()
    }

    fn staged_path(path: &Path, suffix: &str) -> PathBuf {
        let mut name: OsString = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }
}

/// Release refused because a newer file took the original name. The staged
/// file stays where it is.
fn occupied(token: &ClaimToken) -> anyhow::Error {
    anyhow!(
        "Failed to release {}: {} was recreated while claimed, leaving staged file in place",
        token.staged.display(),
        token.original.display()
    )
}

#[async_trait]
impl ClaimManager for RenameClaimManager {
    async fn claim(&self, path: &Path) -> Result<ClaimToken> {
        let suffix = match &self.staging_suffix {
            None => {
                return Ok(ClaimToken {
                    original: path.to_path_buf(),
                    staged: path.to_path_buf(),
                    exclusive: false,
                    released: false,
                })
            }
            Some(suffix) => suffix,
        };

        let staged = Self::staged_path(path, suffix);
        tokio::fs::rename(path, &staged)
            .await
            .with_context(|| format!("Failed to rename {} to staging", path.display()))?;
        debug!("claimed file={} staged={}", path.display(), staged.display());

        Ok(ClaimToken {
            original: path.to_path_buf(),
            staged,
            exclusive: true,
            released: false,
        })
    }

    async fn release(&self, token: &mut ClaimToken) -> Result<()> {
        if token.released || !token.exclusive {
            token.released = true;
            return Ok(());
        }
        token.released = true;

        // A hard link fails instead of replacing a file the collector wrote
        // under the original name while the claim was held
        match tokio::fs::hard_link(&token.staged, &token.original).await {
            Ok(()) => {
                tokio::fs::remove_file(&token.staged).await.with_context(|| {
                    format!("Failed to remove {} after release", token.staged.display())
                })?;
                debug!("released file={}", token.original.display());
                return Ok(());
            }
            // Someone else already moved or removed it
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(occupied(token)),
            Err(e) => debug!(
                "hard link unavailable, releasing by rename staged={} error={}",
                token.staged.display(),
                e
            ),
        }

        if tokio::fs::try_exists(&token.original).await.unwrap_or(true) {
            return Err(occupied(token));
        }
        match tokio::fs::rename(&token.staged, &token.original).await {
            Ok(()) => {
                debug!("released file={}", token.original.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!(e).context(format!(
                "Failed to rename {} back to {}",
                token.staged.display(),
                token.original.display()
            ))),
        }
    }

    async fn finalize(&self, token: ClaimToken) -> Result<()> {
        match &self.disposal {
            Disposal::Delete => {
                tokio::fs::remove_file(&token.staged)
                    .await
                    .with_context(|| format!("Failed to remove {}", token.staged.display()))?;
            }
            Disposal::Archive(dir) => {
                let name = token.file_name()?;
                let dest = archive_file(&token.staged, dir, &name, self.clock.now()).await?;
                debug!("archived file={} dest={}", token.original.display(), dest.display());
            }
        }
        Ok(())
    }
}

/// Put back files left in staging by a previous run.
///
/// Any `name + suffix` in `dir` is renamed to `name` unless `name` already
/// exists. Returns how many files were recovered.
pub async fn recover_stale_claims(dir: &Path, suffix: &str) -> Result<usize> {
    if suffix.is_empty() {
        return Ok(0);
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read queue dir {}", dir.display()))?;
    let mut recovered = 0;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let original_name = match name.strip_suffix(suffix) {
            Some(original) if !original.is_empty() => original.to_string(),
            _ => continue,
        };
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }

        let original = dir.join(&original_name);
        if tokio::fs::try_exists(&original).await.unwrap_or(true) {
            warn!(
                "stale claim not recovered, original exists staged={} original={}",
                entry.path().display(),
                original.display()
            );
            continue;
        }
        match tokio::fs::rename(entry.path(), &original).await {
            Ok(()) => {
                warn!("recovered stale claim file={}", original.display());
                recovered += 1;
            }
            Err(e) => warn!(
                "failed to recover stale claim staged={} error={}",
                entry.path().display(),
                e
            ),
        }
    }

    Ok(recovered)
}
