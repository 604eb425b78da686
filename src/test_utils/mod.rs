//! Test utilities for santa-sleigh
//!
//! Fakes and fixture helpers shared by the unit tests.

#![cfg(test)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::cloud::{UploadBody, UploadUnit, Uploader};

/// Uploader that keeps every payload in memory.
///
/// Records keys in call order, tracks the peak number of concurrent calls and
/// can be told to fail or to sleep inside each call.
#[derive(Default)]
pub struct RecordingUploader {
    keys: Mutex<Vec<String>>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
    fail: bool,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every upload returns an error
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    pub fn body_for(&self, key: &str) -> Option<Vec<u8>> {
        self.bodies.lock().unwrap().get(key).cloned()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Uploads currently inside `upload`
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl RecordingUploader {
    async fn record(&self, unit: UploadUnit) -> Result<()> {
        if self.fail {
            bail!("simulated upload failure for {}", unit.key);
        }
        let data = match unit.body {
            UploadBody::Bytes(bytes) => bytes.to_vec(),
            UploadBody::File(mut file) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data).await?;
                data
            }
        };
        if data.len() as u64 != unit.size {
            bail!("declared size {} but read {}", unit.size, data.len());
        }
        self.keys.lock().unwrap().push(unit.key.clone());
        self.bodies.lock().unwrap().insert(unit.key, data);
        Ok(())
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, unit: UploadUnit) -> Result<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.record(unit).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Set a file's modification time
pub fn set_mtime(path: &Path, when: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}

/// Decompress a gzip payload
pub async fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoder = GzipDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await.unwrap();
    out
}
