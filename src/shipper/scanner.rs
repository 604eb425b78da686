use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use log::debug;

/// A file discovered in the queue directory. Not claimed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub path: PathBuf,
    pub size: u64,
    /// `None` when the file could not be stat'ed at discovery
    pub modified: Option<SystemTime>,
}

/// Oldest first. Entries whose mtime is unknown sort after the rest,
/// lexically, and ties break on the path so the order is total.
fn dispatch_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    match (a.modified, b.modified) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.path.cmp(&b.path)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.path.cmp(&b.path),
    }
}

/// List shippable files in `dir`, oldest modification time first.
///
/// Subdirectories and names ending in `staging_suffix` are skipped. An empty
/// directory is not an error; an unreadable one is.
pub async fn scan_queue(dir: &Path, staging_suffix: Option<&str>) -> Result<Vec<QueueEntry>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read queue dir {}", dir.display()))?;

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list queue dir {}", dir.display()))?
    {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = staging_suffix.filter(|s| !s.is_empty()) {
            if name.ends_with(suffix) {
                continue;
            }
        }

        let path = entry.path();
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => continue,
            Ok(meta) => found.push(QueueEntry {
                modified: meta.modified().ok(),
                size: meta.len(),
                path,
            }),
            Err(e) => {
                debug!("stat failed during scan file={} error={}", path.display(), e);
                found.push(QueueEntry {
                    path,
                    size: 0,
                    modified: None,
                });
            }
        }
    }

    found.sort_by(dispatch_order);
    Ok(found)
}
