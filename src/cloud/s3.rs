use std::future::Future;
use std::io::SeekFrom;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::TryStreamExt;
use log::{debug, warn};
use rusoto_core::ByteStream;
use rusoto_s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedMultipartUpload,
    CompletedPart, CreateMultipartUploadRequest, PutObjectRequest, S3Client, UploadPartRequest, S3,
};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::sleep;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::cloud::client::create_s3_client;
use crate::cloud::uploader::{UploadBody, UploadUnit, Uploader};
use crate::config::StorageConfig;
use crate::constants::{
    LARGE_FILE_THRESHOLD, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_SECS,
    S3_UPLOAD_CHUNK_SIZE as UPLOAD_CHUNK_SIZE,
};

const CANNED_ACL: &str = "private";

/// Delay before retry number `attempt` (1-based): 250ms * 2^attempt, capped
pub fn backoff_delay(attempt: usize) -> Duration {
    let exp = attempt.min(16) as u32;
    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(2u64.pow(exp)));
    delay.min(Duration::from_secs(RETRY_MAX_DELAY_SECS))
}

/// Uploader backed by Amazon S3 or any S3-compatible endpoint.
///
/// Small payloads go up in a single PutObject, files larger than
/// [`LARGE_FILE_THRESHOLD`] use a multipart upload. Every request is retried
/// with exponential backoff up to `max_retries` attempts.
pub struct S3Uploader {
    bucket: String,
    client: S3Client,
    max_retries: usize,
}

impl S3Uploader {
    /// Build an uploader from the storage section of the config
    pub fn new(storage: &StorageConfig, max_retries: usize) -> Result<Self> {
        let bucket = storage
            .bucket
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| anyhow!("storage bucket is required"))?;
        let client = create_s3_client(storage)?;
        Ok(Self::with_client(client, bucket, max_retries))
    }

    pub fn with_client(client: S3Client, bucket: &str, max_retries: usize) -> Self {
        Self {
            bucket: bucket.to_string(),
            client,
            max_retries: max_retries.max(1),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Run `op` until it succeeds or the attempt budget is spent
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_retries => {
                    return Err(e.context(format!("{} failed after {} attempts", what, attempt)));
                }
                Err(e) => {
                    let delay = backoff_delay(attempt);
                    warn!("{} attempt {} failed, retrying in {:?}: {:#}", what, attempt, delay, e);
                    sleep(delay).await;
                }
            }
        }
    }

    fn put_request(&self, key: &str, body: ByteStream, size: u64) -> PutObjectRequest {
        PutObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            body: Some(body),
            content_length: Some(size as i64),
            acl: Some(CANNED_ACL.to_string()),
            ..Default::default()
        }
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        self.with_retries("PutObject", || {
            let request = self.put_request(key, ByteStream::from(data.to_vec()), size);
            async move {
                self.client.put_object(request).await?;
                Ok(())
            }
        })
        .await
    }

    /// Stream a file in one PutObject. Every attempt rewinds a cloned handle
    /// so retries resend the whole file.
    async fn put_file(&self, key: &str, file: &File, size: u64) -> Result<()> {
        self.with_retries("PutObject", || async move {
            let mut handle = file.try_clone().await.context("Failed to clone file handle")?;
            handle.seek(SeekFrom::Start(0)).await.context("Failed to rewind file")?;
            let stream = FramedRead::new(handle, BytesCodec::new()).map_ok(BytesMut::freeze);
            let request = self.put_request(key, ByteStream::new_with_size(stream, size as usize), size);
            self.client.put_object(request).await?;
            Ok(())
        })
        .await
    }

    async fn put_multipart(&self, key: &str, mut file: File, size: u64) -> Result<()> {
        let created = self
            .with_retries("CreateMultipartUpload", || async move {
                let output = self
                    .client
                    .create_multipart_upload(CreateMultipartUploadRequest {
                        bucket: self.bucket.clone(),
                        key: key.to_string(),
                        acl: Some(CANNED_ACL.to_string()),
                        ..Default::default()
                    })
                    .await?;
                Ok(output)
            })
            .await?;
        let upload_id = created
            .upload_id
            .ok_or_else(|| anyhow!("No upload ID returned from S3"))?;

        debug!("Started multipart upload upload_id={} key={}", upload_id, key);

        match self.upload_parts(key, &upload_id, &mut file, size).await {
            Ok(parts) => {
                let request = CompleteMultipartUploadRequest {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    upload_id: upload_id.clone(),
                    multipart_upload: Some(CompletedMultipartUpload { parts: Some(parts) }),
                    ..Default::default()
                };
                self.client
                    .complete_multipart_upload(request)
                    .await
                    .context("Failed to complete multipart upload")?;
                Ok(())
            }
            Err(e) => {
                let abort = self
                    .client
                    .abort_multipart_upload(AbortMultipartUploadRequest {
                        bucket: self.bucket.clone(),
                        key: key.to_string(),
                        upload_id: upload_id.clone(),
                        ..Default::default()
                    })
                    .await;
                if let Err(abort_err) = abort {
                    warn!("Failed to abort multipart upload upload_id={} error={}", upload_id, abort_err);
                }
                Err(e.context("Part upload failed, aborted multipart upload"))
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        file: &mut File,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        file.seek(SeekFrom::Start(0)).await.context("Failed to rewind file")?;

        let num_parts = (size + UPLOAD_CHUNK_SIZE as u64 - 1) / UPLOAD_CHUNK_SIZE as u64;
        let mut parts = Vec::with_capacity(num_parts as usize);

        for part_number in 1..=num_parts as i64 {
            let start = (part_number as u64 - 1) * UPLOAD_CHUNK_SIZE as u64;
            let part_size = (size - start).min(UPLOAD_CHUNK_SIZE as u64) as usize;
            let mut buffer = vec![0u8; part_size];
            file.read_exact(&mut buffer)
                .await
                .with_context(|| format!("Failed to read part {} of {}", part_number, key))?;

            let what = format!("UploadPart {}", part_number);
            let e_tag = self
                .with_retries(&what, || {
                    let request = UploadPartRequest {
                        bucket: self.bucket.clone(),
                        key: key.to_string(),
                        upload_id: upload_id.to_string(),
                        part_number,
                        content_length: Some(buffer.len() as i64),
                        body: Some(ByteStream::from(buffer.clone())),
                        ..Default::default()
                    };
                    async move {
                        let output = self.client.upload_part(request).await?;
                        output.e_tag.ok_or_else(|| anyhow!("No ETag in upload part response"))
                    }
                })
                .await?;

            parts.push(CompletedPart {
                e_tag: Some(e_tag),
                part_number: Some(part_number),
            });
        }

        Ok(parts)
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    async fn upload(&self, unit: UploadUnit) -> Result<()> {
        if unit.key.is_empty() {
            bail!("upload key must not be empty");
        }

        let start = Instant::now();
        let UploadUnit { key, body, size } = unit;
        let result = match body {
            UploadBody::Bytes(data) => self.put_bytes(&key, data).await,
            UploadBody::File(file) if size > LARGE_FILE_THRESHOLD => {
                self.put_multipart(&key, file, size).await
            }
            UploadBody::File(file) => self.put_file(&key, &file, size).await,
        };
        result.with_context(|| format!("Failed to put object s3://{}/{}", self.bucket, key))?;

        debug!(
            "put object bucket={} key={} size_bytes={} elapsed={:?}",
            self.bucket,
            key,
            size,
            start.elapsed()
        );
        Ok(())
    }
}
