//! Streaming object ingestion with crash-safe publication

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use udisk_chunker::{ContentHash, ContentHasher};

use crate::errors::{CasError, Result};

/// Writer for an object whose digest is only known once all bytes are in.
///
/// Bytes go to a uniquely named file under the store's `incoming/`
/// directory while being hashed. [`ContentStore::commit`] then publishes the
/// file under its digest, or discards it when the object already exists.
///
/// [`ContentStore::commit`]: crate::ContentStore::commit
pub struct ObjectWriter {
    temp_path: PathBuf,
    file: Option<fs::File>,
    hasher: ContentHasher,
}

impl ObjectWriter {
    pub(crate) async fn create(incoming_dir: &Path) -> Result<Self> {
        fs::create_dir_all(incoming_dir).await?;
        let temp_path = incoming_dir.join(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        let file = fs::File::create(&temp_path).await.map_err(|e| {
            CasError::AtomicWriteFailed(format!("Failed to create temp file: {}", e))
        })?;

        Ok(Self {
            temp_path,
            file: Some(file),
            hasher: ContentHasher::new(),
        })
    }

    /// Append bytes to the object
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CasError::InvalidOperation("Writer already finalized".to_string()))?;

        file.write_all(data).await?;
        self.hasher.update(data);
        Ok(())
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.hasher.bytes_hashed()
    }

    /// Digest of the bytes written so far
    pub fn current_hash(&self) -> ContentHash {
        self.hasher.finalize()
    }

    /// Flush and close the temp file, returning its path, digest and size.
    pub(crate) async fn finish(mut self, sync: bool) -> Result<(PathBuf, ContentHash, u64)> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| CasError::InvalidOperation("Writer already finalized".to_string()))?;

        file.flush().await?;
        if sync {
            file.sync_all().await.map_err(|e| {
                CasError::AtomicWriteFailed(format!("Failed to sync temp file: {}", e))
            })?;
        }
        drop(file);

        let hash = self.hasher.finalize();
        let size = self.hasher.bytes_hashed();
        debug!("Finished staging object {} ({} bytes)", hash, size);

        Ok((self.temp_path.clone(), hash, size))
    }

    /// Abort the write and remove the temp file
    pub async fn abort(mut self) -> Result<()> {
        if self.file.take().is_some() {
            if let Err(e) = fs::remove_file(&self.temp_path).await {
                warn!(
                    "Failed to clean up temp file {}: {}",
                    self.temp_path.display(),
                    e
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_writer_tracks_hash_and_size() {
        let dir = tempdir().unwrap();
        let mut writer = ObjectWriter::create(dir.path()).await.unwrap();

        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        assert_eq!(writer.bytes_written(), 11);
        assert_eq!(writer.current_hash(), ContentHash::of(b"hello world"));

        let (path, hash, size) = writer.finish(false).await.unwrap();
        assert_eq!(hash, ContentHash::of(b"hello world"));
        assert_eq!(size, 11);
        assert_eq!(fs::read(&path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_abort_removes_temp_file() {
        let dir = tempdir().unwrap();
        let mut writer = ObjectWriter::create(dir.path()).await.unwrap();
        writer.write(b"discard me").await.unwrap();
        let temp_path = writer.temp_path.clone();
        assert!(temp_path.exists());

        writer.abort().await.unwrap();
        assert!(!temp_path.exists());
    }
}
