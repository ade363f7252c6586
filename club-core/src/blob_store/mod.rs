//! Blob store abstraction: key-addressed objects with public download URLs.
pub mod s3;

pub use s3::{S3BlobStore, S3Config};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Progress callback type: (bytes_written, total_bytes)
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// What a successful write hands back; the download URL is derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    pub key: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data` under `key`, creating or overwriting, reporting progress
    /// as bytes are accepted by the store.
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        on_progress: ProgressCallback,
    ) -> Result<BlobHandle, BlobStoreError>;

    /// Durable public URL for a written blob.
    async fn download_url(&self, handle: &BlobHandle) -> Result<String, BlobStoreError>;
}
