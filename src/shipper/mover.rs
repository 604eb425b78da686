//! Archival moves that survive filesystem boundaries.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::io::AsyncWriteExt;

use crate::constants::ROTATION_TIMESTAMP_FORMAT;
#[cfg(unix)]
use crate::constants::ARCHIVE_FILE_MODE;

fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

/// Move `src` to `dst`, renaming when possible
pub async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    move_file_with(src, dst, |from, to| tokio::fs::rename(from, to)).await
}

/// Move `src` to `dst` using `rename`, falling back to copy + fsync + remove
/// when `rename` reports a cross-device error.
///
/// The fallback is not atomic: a crash in the middle can leave both copies.
pub async fn move_file_with<F, Fut>(src: &Path, dst: &Path, rename: F) -> Result<()>
where
    F: Fn(PathBuf, PathBuf) -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    match rename(src.to_path_buf(), dst.to_path_buf()).await {
        Ok(()) => return Ok(()),
        Err(e) if is_cross_device(&e) => {
            debug!(
                "rename crosses devices, copying src={} dst={}",
                src.display(),
                dst.display()
            );
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to rename {} to {}", src.display(), dst.display()));
        }
    }

    let data = tokio::fs::read(src)
        .await
        .with_context(|| format!("Failed to read {}", src.display()))?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(ARCHIVE_FILE_MODE);

    let mut file = options
        .open(dst)
        .await
        .with_context(|| format!("Failed to create {}", dst.display()))?;
    file.write_all(&data)
        .await
        .with_context(|| format!("Failed to write {}", dst.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("Failed to sync {}", dst.display()))?;

    tokio::fs::remove_file(src)
        .await
        .with_context(|| format!("Failed to remove {} after copy", src.display()))?;
    Ok(())
}

/// `a.parquet` -> `a-20240101T000000Z.parquet`
fn collision_name(name: &str, now: DateTime<Utc>) -> String {
    let stamp = now.format(ROTATION_TIMESTAMP_FORMAT);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, stamp, ext),
        _ => format!("{}-{}", name, stamp),
    }
}

/// Move a staged file into `archive_dir` under `original_name`.
///
/// If that name is taken, retries once with a timestamp-suffixed name.
/// Returns the final archive path.
pub async fn archive_file(
    staged: &Path,
    archive_dir: &Path,
    original_name: &str,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    archive_file_with(staged, archive_dir, original_name, now, |from, to| {
        tokio::fs::rename(from, to)
    })
    .await
}

pub async fn archive_file_with<F, Fut>(
    staged: &Path,
    archive_dir: &Path,
    original_name: &str,
    now: DateTime<Utc>,
    rename: F,
) -> Result<PathBuf>
where
    F: Fn(PathBuf, PathBuf) -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    tokio::fs::create_dir_all(archive_dir)
        .await
        .with_context(|| format!("Failed to create archive dir {}", archive_dir.display()))?;

    let mut dest = archive_dir.join(original_name);
    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        let renamed = archive_dir.join(collision_name(original_name, now));
        warn!(
            "archive name taken, using suffixed name existing={} dest={}",
            dest.display(),
            renamed.display()
        );
        if tokio::fs::try_exists(&renamed).await.unwrap_or(false) {
            bail!("archive destination {} already exists", renamed.display());
        }
        dest = renamed;
    }

    move_file_with(staged, &dest, rename).await?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    async fn cross_device(_: PathBuf, _: PathBuf) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EXDEV))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_collision_name() {
        assert_eq!(collision_name("a.parquet", now()), "a-20240501T083000Z.parquet");
        assert_eq!(collision_name("noext", now()), "noext-20240501T083000Z");
        assert_eq!(collision_name(".hidden", now()), ".hidden-20240501T083000Z");
    }

    #[tokio::test]
    async fn test_move_same_device() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, b"data").unwrap();

        move_file(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_cross_device_fallback_copies_and_removes() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.parquet.partial");
        let dst = dir.path().join("a.parquet");
        let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        fs::write(&src, &payload).unwrap();

        move_file_with(&src, &dst, cross_device).await.unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), payload);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, ARCHIVE_FILE_MODE);
        }
    }

    #[tokio::test]
    async fn test_other_rename_errors_are_not_retried() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, b"x").unwrap();

        let err = move_file_with(&src, &dir.path().join("dst"), |_, _| async {
            Err::<(), _>(io::Error::from(io::ErrorKind::PermissionDenied))
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("Failed to rename"));
        assert!(src.exists());
    }

    #[tokio::test]
    async fn test_archive_creates_dir() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("a.parquet.partial");
        fs::write(&staged, b"a").unwrap();
        let archive = dir.path().join("nested").join("archive");

        let dest = archive_file(&staged, &archive, "a.parquet", now()).await.unwrap();

        assert_eq!(dest, archive.join("a.parquet"));
        assert_eq!(fs::read(&dest).unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_archive_collision_uses_timestamp_suffix() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir_all(&archive).unwrap();
        fs::write(archive.join("a.parquet"), b"old").unwrap();
        let staged = dir.path().join("a.parquet.partial");
        fs::write(&staged, b"new").unwrap();

        let dest = archive_file(&staged, &archive, "a.parquet", now()).await.unwrap();

        assert_eq!(dest, archive.join("a-20240501T083000Z.parquet"));
        assert_eq!(fs::read(archive.join("a.parquet")).unwrap(), b"old");
        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_archive_second_collision_fails() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir_all(&archive).unwrap();
        fs::write(archive.join("a.parquet"), b"old").unwrap();
        fs::write(archive.join("a-20240501T083000Z.parquet"), b"older").unwrap();
        let staged = dir.path().join("a.parquet.partial");
        fs::write(&staged, b"new").unwrap();

        assert!(archive_file(&staged, &archive, "a.parquet", now()).await.is_err());
        assert!(staged.exists());
    }

    #[tokio::test]
    async fn test_archive_across_devices() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        let staged = dir.path().join("b.parquet.partial");
        fs::write(&staged, b"bytes").unwrap();

        let dest = archive_file_with(&staged, &archive, "b.parquet", now(), cross_device)
            .await
            .unwrap();

        assert_eq!(fs::read(dest).unwrap(), b"bytes");
        assert!(!staged.exists());
    }
}
