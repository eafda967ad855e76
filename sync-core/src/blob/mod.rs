//! Opaque blob storage used for source files and temporary audio chunks.

mod local;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub use local::LocalBlobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
}

/// Content-addressed byte container. Paths are opaque to callers apart
/// from the temp-chunk convention below.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Byte-range read, for streaming audio to the reader.
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every object under `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    async fn stat(&self, key: &str) -> Result<BlobStat>;

    /// Stage an object to a local file, returning the byte count written.
    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let bytes = self.get(key).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

/// Blob key for one temporary session chunk.
pub fn temp_chunk_key(session_id: &str, index: usize, ext: &str) -> String {
    format!("temp_chunks/{}/chunk_{}.{}", session_id, index, ext)
}

/// Key prefix holding all of a session's temporary chunks.
pub fn temp_chunk_prefix(session_id: &str) -> String {
    format!("temp_chunks/{}/", session_id)
}
