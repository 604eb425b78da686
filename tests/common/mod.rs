//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use santa_sleigh::cloud::{UploadBody, UploadUnit, Uploader};
use santa_sleigh::shipper::claim::{ClaimManager, ClaimToken};

/// In-memory object store
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<Vec<(String, Vec<u8>)>>,
    fail_suffixes: Vec<String>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject keys ending in `suffix`
    pub fn failing_on(mut self, suffix: &str) -> Self {
        self.fail_suffixes.push(suffix.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn objects(&self) -> HashMap<String, Vec<u8>> {
        self.objects.lock().unwrap().iter().cloned().collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn store(&self, unit: UploadUnit) -> Result<()> {
        if self.fail_suffixes.iter().any(|s| unit.key.ends_with(s.as_str())) {
            bail!("503 Slow Down for {}", unit.key);
        }
        let data = match unit.body {
            UploadBody::Bytes(bytes) => bytes.to_vec(),
            UploadBody::File(mut file) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data).await?;
                data
            }
        };
        self.objects.lock().unwrap().push((unit.key, data));
        Ok(())
    }
}

#[async_trait]
impl Uploader for MemoryStore {
    async fn upload(&self, unit: UploadUnit) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.store(unit).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Claim manager that records the order in which files were claimed
pub struct OrderedClaims<C> {
    inner: C,
    order: Mutex<Vec<PathBuf>>,
}

impl<C> OrderedClaims<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn order(&self) -> Vec<PathBuf> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl<C: ClaimManager> ClaimManager for OrderedClaims<C> {
    async fn claim(&self, path: &Path) -> Result<ClaimToken> {
        self.order.lock().unwrap().push(path.to_path_buf());
        self.inner.claim(path).await
    }

    async fn release(&self, token: &mut ClaimToken) -> Result<()> {
        self.inner.release(token).await
    }

    async fn finalize(&self, token: ClaimToken) -> Result<()> {
        self.inner.finalize(token).await
    }
}

/// Write `content` to `dir/name` with the given mtime
pub fn queue_file(dir: &Path, name: &str, content: &[u8], mtime: SystemTime) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
    path
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub async fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzipDecoder::new(data).read_to_end(&mut out).await.unwrap();
    out
}
