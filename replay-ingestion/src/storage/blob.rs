use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("invalid range for {key}: start {start}, length {length}")]
    InvalidRange { key: String, start: u64, length: u64 },
    #[error("blob store {operation} failed: {reason}")]
    Backend {
        operation: &'static str,
        reason: String,
    },
}

/// Byte storage for recording segments and merged buffers.
///
/// Keys are content addressed, so `set` may be called more than once for the
/// same key with the same bytes and must simply overwrite.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Bytes, BlobStoreError>;

    async fn set(&self, key: &str, data: Bytes) -> Result<(), BlobStoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;

    /// Read `length` bytes starting at `start`.
    async fn get_range(&self, key: &str, start: u64, length: u64)
        -> Result<Bytes, BlobStoreError>;
}
