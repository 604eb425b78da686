use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;

/// Payload handed to an [`Uploader`]
#[derive(Debug)]
pub enum UploadBody {
    /// Fully buffered payload, e.g. a compressed tail chunk
    Bytes(Bytes),
    /// Open handle on a claimed queue file, positioned at the start
    File(File),
}

/// One upload request: where to put the bytes, the bytes, and how many.
///
/// Built fresh for every upload and consumed by the call.
#[derive(Debug)]
pub struct UploadUnit {
    pub key: String,
    pub body: UploadBody,
    pub size: u64,
}

impl UploadUnit {
    pub fn from_bytes(key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            key: key.into(),
            size: data.len() as u64,
            body: UploadBody::Bytes(data),
        }
    }

    pub fn from_file(key: impl Into<String>, file: File, size: u64) -> Self {
        Self {
            key: key.into(),
            body: UploadBody::File(file),
            size,
        }
    }
}

/// Durable transfer of one payload to object storage.
///
/// Implementations own retries and multipart handling; the shipping pipeline
/// only cares whether the object landed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, unit: UploadUnit) -> Result<()>;
}
