use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::atomic::ObjectWriter;
use crate::errors::{CasError, Result};
use udisk_chunker::ContentHash;

/// When object files and their shard directories are flushed to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Sync each object file and its directory on publication
    Always,
    /// Sync each object file; sync the directory every N publications
    Batch(u32),
    /// Leave flushing to the OS
    Async,
    /// No syncing at all; for tests
    Never,
}

#[derive(Debug, Clone)]
pub struct ContentStoreConfig {
    pub fsync_policy: FsyncPolicy,
    /// Run [`ContentStore::recover`] when the store is opened
    pub enable_recovery: bool,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            fsync_policy: FsyncPolicy::Always,
            enable_recovery: true,
        }
    }
}

/// Outcome of a [`ContentStore::recover`] pass
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    /// Temp files whose bytes matched their target and were published
    pub recovered: usize,
    /// Temp files deleted as redundant, damaged or abandoned
    pub cleaned: usize,
    pub errors: Vec<String>,
}

/// Digest and length of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub hash: ContentHash,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub object_count: u64,
    /// Sum of object sizes in bytes
    pub total_size: u64,
}

/// Content-addressed storage for deduplicated file bodies.
///
/// Objects are stored under their Blake3 hash, so identical bytes written
/// from any number of logical paths land in a single object. Objects are
/// stored in a sharded directory structure to keep directories small.
///
/// # Storage Layout
///
/// Objects are stored at: `{root}/objects/{shard1}/{shard2}/{rest}`
/// where shard1 and shard2 are the first 2 and next 2 characters of the hex
/// hash. Streaming writes are staged in `{root}/incoming/` until committed.
///
/// # Example
///
/// ```rust,no_run
/// use udisk_cas::ContentStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = ContentStore::new("/tmp/udisk-cas").await?;
///
/// let obj_ref = store.write(b"Hello, World!").await?;
/// let retrieved = store.read(&obj_ref.hash).await?;
/// assert_eq!(&retrieved[..], b"Hello, World!");
/// # Ok(())
/// # }
/// ```
pub struct ContentStore {
    root_path: PathBuf,
    config: ContentStoreConfig,
    pending_syncs: Arc<AtomicU32>,
}

impl ContentStore {
    /// Create a new content store at the given path with default configuration.
    pub async fn new(root_path: impl AsRef<Path>) -> Result<Self> {
        Self::new_with_config(root_path, ContentStoreConfig::default()).await
    }

    /// Create a new content store with custom configuration.
    ///
    /// This will create the necessary directory structure if it doesn't exist.
    /// If recovery is enabled, it will scan for and recover any incomplete writes.
    pub async fn new_with_config(
        root_path: impl AsRef<Path>,
        config: ContentStoreConfig,
    ) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        fs::create_dir_all(root_path.join("objects")).await?;
        fs::create_dir_all(root_path.join("incoming")).await?;

        debug!(
            "Content store initialized at {:?} with config {:?}",
            root_path, config
        );

        let store = Self {
            root_path,
            config: config.clone(),
            pending_syncs: Arc::new(AtomicU32::new(0)),
        };

        if config.enable_recovery {
            store.recover().await?;
        }

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    /// Get the path for an object with sharding
    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        let (shard1, rest) = hex.split_at(2);
        let (shard2, filename) = rest.split_at(2);

        self.root_path
            .join("objects")
            .join(shard1)
            .join(shard2)
            .join(filename)
    }

    /// Write an object to the content store.
    ///
    /// The object is written atomically using a temporary file and rename.
    /// If an object with the same hash already exists, this is a no-op.
    pub async fn write(&self, data: &[u8]) -> Result<ObjectRef> {
        let hash = ContentHash::of(data);
        let object_ref = ObjectRef {
            hash,
            size: data.len() as u64,
        };

        let object_path = self.object_path(&hash);
        if fs::try_exists(&object_path).await? {
            trace!("Object {} already exists", hash);
            return Ok(object_ref);
        }

        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        self.write_atomic(&object_path, data).await?;

        debug!("Wrote object {} ({} bytes)", hash, data.len());
        Ok(object_ref)
    }

    /// Start a streaming write for an object of not-yet-known digest.
    pub async fn begin_write(&self) -> Result<ObjectWriter> {
        ObjectWriter::create(&self.root_path.join("incoming")).await
    }

    /// Publish a streaming write under its digest.
    ///
    /// When the object already exists the staged bytes are discarded and the
    /// existing object is kept.
    pub async fn commit(&self, writer: ObjectWriter) -> Result<ObjectRef> {
        let (temp_path, hash, size) = writer.finish(self.should_fsync_file()).await?;
        let object_path = self.object_path(&hash);

        if fs::try_exists(&object_path).await? {
            trace!("Object {} already exists, discarding staged copy", hash);
            if let Err(e) = fs::remove_file(&temp_path).await {
                warn!("Failed to remove staged copy {:?}: {}", temp_path, e);
            }
            return Ok(ObjectRef { hash, size });
        }

        let shard_dir = object_path
            .parent()
            .ok_or_else(|| CasError::StoragePath("Invalid object path".to_string()))?;
        fs::create_dir_all(shard_dir).await?;

        self.publish(&temp_path, &object_path).await?;

        debug!("Committed object {} ({} bytes)", hash, size);
        Ok(ObjectRef { hash, size })
    }

    /// Read an object from the content store, verifying its hash.
    ///
    /// # Errors
    ///
    /// - `ObjectNotFound` if the object doesn't exist
    /// - `HashMismatch` if the stored data doesn't match the expected hash
    pub async fn read(&self, hash: &ContentHash) -> Result<Bytes> {
        let object_path = self.object_path(hash);

        let data = match fs::read(&object_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CasError::ObjectNotFound(*hash));
            }
            Err(e) => return Err(e.into()),
        };

        let actual_hash = ContentHash::of(&data);
        if actual_hash != *hash {
            return Err(CasError::HashMismatch {
                expected: *hash,
                actual: actual_hash,
            });
        }

        trace!("Read object {} ({} bytes)", hash, data.len());
        Ok(Bytes::from(data))
    }

    /// Open an object as a byte stream.
    pub async fn open(&self, hash: &ContentHash) -> Result<File> {
        match File::open(self.object_path(hash)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CasError::ObjectNotFound(*hash))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read `length` bytes starting at `offset` from an object.
    pub async fn read_range(&self, hash: &ContentHash, offset: u64, length: u64) -> Result<Bytes> {
        let mut file = self.open(hash).await?;
        let size = file.metadata().await?.len();

        let end = offset.checked_add(length);
        if end.map_or(true, |end| end > size) {
            return Err(CasError::RangeOutOfBounds {
                hash: *hash,
                offset,
                length,
                size,
            });
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;

        trace!("Read {} bytes at {} from object {}", length, offset, hash);
        Ok(Bytes::from(buf))
    }

    /// Size of a stored object in bytes.
    pub async fn size(&self, hash: &ContentHash) -> Result<u64> {
        match fs::metadata(self.object_path(hash)).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CasError::ObjectNotFound(*hash))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check if an object exists in the store.
    pub async fn exists(&self, hash: &ContentHash) -> bool {
        fs::try_exists(self.object_path(hash))
            .await
            .unwrap_or(false)
    }

    /// Verify an object's integrity by reading and checking its hash.
    ///
    /// Returns `Ok(false)` if the object is missing or damaged.
    pub async fn verify(&self, hash: &ContentHash) -> Result<bool> {
        match self.read(hash).await {
            Ok(_) => Ok(true),
            Err(CasError::ObjectNotFound(_)) => Ok(false),
            Err(CasError::HashMismatch { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write `data` to a unique temp file next to `final_path` and rename it
    /// into place.
    async fn write_atomic(&self, final_path: &Path, data: &[u8]) -> Result<()> {
        let temp_dir = final_path
            .parent()
            .ok_or_else(|| CasError::StoragePath("Invalid object path".to_string()))?;

        // Each writer gets its own temp file so concurrent writes of the same
        // object never share one.
        let temp_path = {
            let mut temp_name = final_path
                .file_name()
                .ok_or_else(|| CasError::StoragePath("Invalid object filename".to_string()))?
                .to_os_string();
            temp_name.push(format!(".tmp.{}", uuid::Uuid::new_v4().simple()));
            temp_dir.join(temp_name)
        };

        {
            let mut file = File::create(&temp_path).await.map_err(|e| {
                CasError::AtomicWriteFailed(format!("Failed to create temp file: {}", e))
            })?;

            file.write_all(data).await.map_err(|e| {
                CasError::AtomicWriteFailed(format!("Failed to write data: {}", e))
            })?;

            if self.should_fsync_file() {
                file.sync_all().await.map_err(|e| {
                    CasError::AtomicWriteFailed(format!("Failed to sync temp file: {}", e))
                })?;
            }
        }

        self.publish(&temp_path, final_path).await
    }

    /// Rename a fully written temp file to its final object path.
    async fn publish(&self, temp_path: &Path, final_path: &Path) -> Result<()> {
        if let Err(e) = fs::rename(temp_path, final_path).await {
            let _ = fs::remove_file(temp_path).await;
            return Err(CasError::AtomicWriteFailed(format!(
                "Failed to rename temp file: {}",
                e
            )));
        }

        let dir = final_path
            .parent()
            .ok_or_else(|| CasError::StoragePath("Invalid object path".to_string()))?;

        match &self.config.fsync_policy {
            FsyncPolicy::Always => self.fsync_directory(dir).await?,
            FsyncPolicy::Batch(batch_size) => {
                let pending = self.pending_syncs.fetch_add(1, Ordering::SeqCst) + 1;
                if pending >= *batch_size {
                    self.pending_syncs.store(0, Ordering::SeqCst);
                    self.fsync_directory(dir).await?;
                }
            }
            FsyncPolicy::Async | FsyncPolicy::Never => {}
        }

        Ok(())
    }

    fn should_fsync_file(&self) -> bool {
        matches!(
            self.config.fsync_policy,
            FsyncPolicy::Always | FsyncPolicy::Batch(_)
        )
    }

    /// Fsync a directory so a rename inside it is durable.
    async fn fsync_directory(&self, dir: &Path) -> Result<()> {
        let dir_file = File::open(dir).await?;
        dir_file.sync_all().await.map_err(|e| {
            CasError::AtomicWriteFailed(format!("Failed to sync directory: {}", e))
        })?;
        Ok(())
    }

    /// Recover from incomplete write operations.
    ///
    /// Temp files next to objects are published when their content matches
    /// the object name they were meant for and removed otherwise. Anything
    /// left in `incoming/` belongs to a streaming write that never committed
    /// and is removed.
    pub async fn recover(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();

        let incoming_dir = self.root_path.join("incoming");
        if let Ok(mut entries) = fs::read_dir(&incoming_dir).await {
            while let Some(entry) = entries.next_entry().await? {
                match fs::remove_file(entry.path()).await {
                    Ok(_) => stats.cleaned += 1,
                    Err(e) => stats
                        .errors
                        .push(format!("Failed to remove {:?}: {}", entry.path(), e)),
                }
            }
        }

        let mut stack = vec![self.root_path.join("objects")];

        while let Some(current_dir) = stack.pop() {
            let mut dir_entries = match fs::read_dir(&current_dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    stats
                        .errors
                        .push(format!("Failed to read directory {:?}: {}", current_dir, e));
                    continue;
                }
            };

            while let Some(entry) = dir_entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if is_temp_name(&path) {
                    if let Err(e) = self.recover_temp_file(&path, &mut stats).await {
                        stats
                            .errors
                            .push(format!("Recovery error for {:?}: {}", path, e));
                    }
                }
            }
        }

        if stats.recovered > 0 || stats.cleaned > 0 || !stats.errors.is_empty() {
            debug!(
                "Recovery completed: recovered={}, cleaned={}, errors={}",
                stats.recovered,
                stats.cleaned,
                stats.errors.len()
            );
        }

        Ok(stats)
    }

    /// Attempt to recover a single temporary file.
    async fn recover_temp_file(&self, temp_path: &Path, stats: &mut RecoveryStats) -> Result<()> {
        let final_path = {
            let temp_name = temp_path
                .file_name()
                .ok_or_else(|| CasError::StoragePath("Invalid temp filename".to_string()))?
                .to_string_lossy()
                .into_owned();
            let final_name = temp_name
                .split(".tmp")
                .next()
                .ok_or_else(|| CasError::StoragePath("Invalid temp filename".to_string()))?
                .to_string();
            let parent = temp_path
                .parent()
                .ok_or_else(|| CasError::StoragePath("Temp file has no parent".to_string()))?;
            parent.join(final_name)
        };

        if fs::try_exists(&final_path).await? {
            fs::remove_file(temp_path).await?;
            stats.cleaned += 1;
            trace!("Cleaned up redundant temp file: {:?}", temp_path);
            return Ok(());
        }

        let data = match fs::read(temp_path).await {
            Ok(data) => data,
            Err(_) => {
                let _ = fs::remove_file(temp_path).await;
                stats.cleaned += 1;
                return Ok(());
            }
        };

        if self.object_path(&ContentHash::of(&data)) == final_path {
            fs::rename(temp_path, &final_path).await?;
            stats.recovered += 1;
            debug!("Recovered temp file: {:?} -> {:?}", temp_path, final_path);
        } else {
            fs::remove_file(temp_path).await?;
            stats.cleaned += 1;
            trace!("Cleaned up corrupted temp file: {:?}", temp_path);
        }

        Ok(())
    }

    /// Count objects and bytes. Walks the whole object tree.
    pub async fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();
        let mut stack = vec![self.root_path.join("objects")];

        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() && !is_temp_name(&entry.path()) {
                    stats.object_count += 1;
                    stats.total_size += entry.metadata().await?.len();
                }
            }
        }

        debug!(
            "Storage stats: {} objects, {} bytes",
            stats.object_count, stats.total_size
        );
        Ok(stats)
    }
}

fn is_temp_name(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().contains(".tmp"))
        .unwrap_or(false)
}
