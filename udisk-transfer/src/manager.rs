//! Task table and chunk staging

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use udisk_cas::{ContentStore, ObjectRef};
use udisk_chunker::{ChunkInfo, ChunkPlan, ContentHash, DEFAULT_CHUNK_SIZE};
use udisk_namespace::{path, NamespaceError, NamespaceTree};

use crate::errors::{Result, TransferError};
use crate::task::{Direction, SizeCategory, Task, TaskStatus};

/// Objects below this size are uploaded as a small single chunk
pub const DEFAULT_SMALL_THRESHOLD: u64 = 1024 * 1024;

/// Objects at or above this size are split into a multi-chunk plan
pub const DEFAULT_LARGE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Largest object an upload may declare
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Transfer manager configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Directory holding per-task staged chunks
    pub staging_root: PathBuf,
    pub chunk_size: u64,
    pub small_threshold: u64,
    pub large_threshold: u64,
    /// Uploads declaring more bytes are refused before a plan is built
    pub max_object_size: u64,
}

impl TransferConfig {
    pub fn new(staging_root: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            small_threshold: DEFAULT_SMALL_THRESHOLD,
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }

    pub fn category(&self, size: u64) -> SizeCategory {
        SizeCategory::classify(size, self.small_threshold, self.large_threshold)
    }

    /// Upload and download share this partitioning
    pub fn plan(&self, size: u64) -> Result<(SizeCategory, ChunkPlan)> {
        let category = self.category(size);
        let plan = match category {
            SizeCategory::Large => ChunkPlan::new(size, self.chunk_size)?,
            SizeCategory::Small | SizeCategory::Regular => ChunkPlan::single(size),
        };
        Ok((category, plan))
    }
}

/// One chunk read back from the content store for a download
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub info: ChunkInfo,
    pub bytes: Bytes,
    pub digest: ContentHash,
}

type TaskTable = Arc<RwLock<HashMap<String, TaskEntry>>>;

struct TaskEntry {
    task: Task,
    tree: Arc<NamespaceTree>,
    received: BTreeSet<u32>,
    /// Set while `complete` assembles the object outside the table lock
    finalizing: bool,
}

impl TaskEntry {
    fn check_active(&self) -> Result<()> {
        if self.task.status.is_terminal() {
            return Err(TransferError::InvalidState(format!(
                "task {} is {:?}",
                self.task.id, self.task.status
            )));
        }
        if self.finalizing {
            return Err(TransferError::InvalidState(format!(
                "task {} is completing",
                self.task.id
            )));
        }
        Ok(())
    }

    fn check_direction(&self, direction: Direction) -> Result<()> {
        if self.task.direction != direction {
            return Err(TransferError::InvalidState(format!(
                "task {} is not an {:?} task",
                self.task.id, direction
            )));
        }
        Ok(())
    }

    fn chunk(&self, index: u32) -> Result<ChunkInfo> {
        self.task.chunk_plan.get(index).copied().ok_or_else(|| {
            TransferError::InvalidChunk(format!(
                "index {} outside plan of {} chunks",
                index,
                self.task.chunk_plan.len()
            ))
        })
    }
}

/// Plans, tracks and completes transfer tasks
pub struct TransferManager {
    config: TransferConfig,
    store: Arc<ContentStore>,
    tasks: TaskTable,
}

impl TransferManager {
    pub fn new(config: TransferConfig, store: Arc<ContentStore>) -> Self {
        Self {
            config,
            store,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn content_store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    fn staging_dir(&self, task_id: &str) -> PathBuf {
        self.config.staging_root.join(task_id)
    }

    async fn insert(&self, task: Task, tree: Arc<NamespaceTree>) -> Task {
        let snapshot = task.clone();
        self.tasks.write().await.insert(
            task.id.clone(),
            TaskEntry {
                task,
                tree,
                received: BTreeSet::new(),
                finalizing: false,
            },
        );
        snapshot
    }

    /// Plan an upload of `declared_size` bytes to a path that must not exist
    pub async fn plan_upload(
        &self,
        tree: Arc<NamespaceTree>,
        target: &str,
        declared_size: u64,
        declared_digest: &str,
    ) -> Result<Task> {
        let expected: ContentHash = declared_digest
            .parse()
            .map_err(|_| TransferError::InvalidDigest(declared_digest.to_string()))?;
        if declared_size > self.config.max_object_size {
            return Err(TransferError::TooLarge {
                size: declared_size,
                limit: self.config.max_object_size,
            });
        }
        let target_path = tree.resolve_path(target).await?;

        match tree.stat(&target_path).await {
            Ok(_) => return Err(TransferError::AlreadyExists(target_path)),
            Err(NamespaceError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let parent = path::parent(&target_path)
            .ok_or_else(|| TransferError::AlreadyExists(target_path.clone()))?;
        if !tree.stat(parent).await?.is_directory() {
            return Err(NamespaceError::NotADirectory(parent.to_string()).into());
        }

        let (category, plan) = self.config.plan(declared_size)?;
        let task = Task::new(
            tree.owner().to_string(),
            Direction::Upload,
            category,
            target_path,
            expected,
            plan,
        );

        info!(
            "Planned {:?} upload {} of {} bytes to {} ({} chunks)",
            category,
            task.id,
            declared_size,
            task.target_path,
            task.chunk_plan.len()
        );
        Ok(self.insert(task, tree).await)
    }

    /// Plan a download of the object a file node points at
    pub async fn plan_download(&self, tree: Arc<NamespaceTree>, target: &str) -> Result<Task> {
        let target_path = tree.resolve_path(target).await?;
        let payload = tree.read(&target_path).await?;

        let digest: ContentHash = std::str::from_utf8(&payload)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                TransferError::InvalidDigest(format!("{} does not reference stored content", target_path))
            })?;
        if !self.store.exists(&digest).await {
            return Err(TransferError::NotFound(format!("object {}", digest)));
        }
        let size = self.store.size(&digest).await?;

        let (category, plan) = self.config.plan(size)?;
        let task = Task::new(
            tree.owner().to_string(),
            Direction::Download,
            category,
            target_path,
            digest,
            plan,
        );

        info!(
            "Planned {:?} download {} of {} ({} chunks)",
            category,
            task.id,
            task.target_path,
            task.chunk_plan.len()
        );
        Ok(self.insert(task, tree).await)
    }

    /// Verify and stage one upload chunk.
    ///
    /// A digest mismatch is reported without touching the task, so the
    /// caller can retry the same index.
    pub async fn accept_chunk(
        &self,
        task_id: &str,
        index: u32,
        data: &[u8],
        declared_digest: &str,
    ) -> Result<()> {
        let declared: ContentHash = declared_digest
            .parse()
            .map_err(|_| TransferError::InvalidDigest(declared_digest.to_string()))?;

        {
            let tasks = self.tasks.read().await;
            let entry = tasks
                .get(task_id)
                .ok_or_else(|| TransferError::TaskNotFound(task_id.to_string()))?;
            entry.check_direction(Direction::Upload)?;
            entry.check_active()?;

            let info = entry.chunk(index)?;
            if data.len() as u64 != info.length {
                return Err(TransferError::InvalidChunk(format!(
                    "chunk {} has {} bytes, planned {}",
                    index,
                    data.len(),
                    info.length
                )));
            }
        }

        let actual = ContentHash::of(data);
        if actual != declared {
            debug!("Rejected chunk {} of task {}: digest mismatch", index, task_id);
            return Err(TransferError::IntegrityMismatch {
                expected: declared.to_hex(),
                actual: actual.to_hex(),
            });
        }

        self.stage_chunk(task_id, index, data).await?;
        self.record_chunk(task_id, index).await
    }

    /// Mark a staged chunk as received.
    ///
    /// A task that turned terminal while the chunk was written has already
    /// released its staging, so the recreated directory is removed again.
    async fn record_chunk(&self, task_id: &str, index: u32) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let still_active = tasks
            .get(task_id)
            .map(|entry| !entry.task.status.is_terminal())
            .unwrap_or(false);
        if !still_active {
            drop(tasks);
            remove_staging(&self.staging_dir(task_id), task_id).await;
            return Err(TransferError::InvalidState(format!(
                "task {} ended while chunk {} was staged",
                task_id, index
            )));
        }

        if let Some(entry) = tasks.get_mut(task_id) {
            entry.received.insert(index);
            entry.task.mark_started();
            debug!(
                "Accepted chunk {} of task {} ({}/{})",
                index,
                task_id,
                entry.received.len(),
                entry.task.chunk_plan.len()
            );
        }
        Ok(())
    }

    /// Write chunk bytes to `{staging}/{task}/{index}` via a unique temp file
    async fn stage_chunk(&self, task_id: &str, index: u32, data: &[u8]) -> Result<()> {
        let dir = self.staging_dir(task_id);
        fs::create_dir_all(&dir).await?;

        let final_path = dir.join(index.to_string());
        let temp_path = dir.join(format!("{}.tmp.{}", index, uuid::Uuid::new_v4().simple()));

        let mut file = fs::File::create(&temp_path).await?;
        let written = async {
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        fs::rename(&temp_path, &final_path).await?;
        Ok(())
    }

    /// Read one planned chunk of a download task
    pub async fn read_chunk(&self, task_id: &str, index: u32) -> Result<ChunkPayload> {
        let (info, digest) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| TransferError::TaskNotFound(task_id.to_string()))?;
            entry.check_direction(Direction::Download)?;
            entry.check_active()?;

            let info = entry.chunk(index)?;
            entry.task.mark_started();
            (info, entry.task.expected_digest)
        };

        let bytes = self
            .store
            .read_range(&digest, info.offset, info.length)
            .await?;

        Ok(ChunkPayload {
            info,
            digest: ContentHash::of(&bytes),
            bytes,
        })
    }

    /// Finish a task.
    ///
    /// Uploads assemble the staged chunks into the content store, check the
    /// whole-object digest and create the target path pointing at it. Any
    /// failure after assembly starts marks the task Failed. Downloads are
    /// simply marked Completed.
    ///
    /// Assembly runs on its own tokio task: once started it always drives
    /// the upload to a terminal state, even if the caller stops waiting.
    pub async fn complete(&self, task_id: &str) -> Result<Task> {
        let (task, tree) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| TransferError::TaskNotFound(task_id.to_string()))?;
            entry.check_active()?;

            if entry.task.direction == Direction::Download {
                entry.task.set_status(TaskStatus::Completed);
                info!("Download {} completed", task_id);
                return Ok(entry.task.clone());
            }

            let missing = entry.task.chunk_plan.len() - entry.received.len();
            if missing > 0 {
                return Err(TransferError::InvalidState(format!(
                    "task {} is missing {} chunks",
                    task_id, missing
                )));
            }

            entry.finalizing = true;
            (entry.task.clone(), Arc::clone(&entry.tree))
        };

        let finalizer = Finalizer {
            store: Arc::clone(&self.store),
            tasks: Arc::clone(&self.tasks),
            staging: self.staging_dir(task_id),
        };
        tokio::spawn(finalizer.run(task, tree)).await?
    }

    /// Cancel a task and release its staged chunks
    pub async fn fail(&self, task_id: &str, reason: &str) -> Result<Task> {
        let snapshot = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| TransferError::TaskNotFound(task_id.to_string()))?;
            entry.check_active()?;
            entry.task.fail(reason);
            entry.task.clone()
        };

        info!("Task {} failed: {}", task_id, reason);
        remove_staging(&self.staging_dir(task_id), task_id).await;
        Ok(snapshot)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| TransferError::TaskNotFound(task_id.to_string()))
    }

    /// Snapshots of every task, oldest first
    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }
}

/// Owned handles for assembling one upload off the caller's task
struct Finalizer {
    store: Arc<ContentStore>,
    tasks: TaskTable,
    staging: PathBuf,
}

impl Finalizer {
    async fn run(self, task: Task, tree: Arc<NamespaceTree>) -> Result<Task> {
        let result = self.finish_upload(&task, &tree).await;

        let snapshot = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(&task.id)
                .ok_or_else(|| TransferError::TaskNotFound(task.id.clone()))?;
            entry.finalizing = false;
            match &result {
                Ok(object) => {
                    entry.task.set_status(TaskStatus::Completed);
                    info!(
                        "Upload {} completed: {} -> {} ({} bytes)",
                        task.id, entry.task.target_path, object.hash, object.size
                    );
                }
                Err(e) => {
                    entry.task.fail(e.to_string());
                    warn!("Upload {} failed: {}", task.id, e);
                }
            }
            entry.task.clone()
        };

        remove_staging(&self.staging, &task.id).await;
        result.map(|_| snapshot)
    }

    async fn finish_upload(&self, task: &Task, tree: &NamespaceTree) -> Result<ObjectRef> {
        let object = self.assemble(task).await?;
        tree.create_new(&task.target_path, object.hash.to_hex().as_bytes())
            .await?;
        Ok(object)
    }

    /// Stream staged chunks in index order into the content store
    async fn assemble(&self, task: &Task) -> Result<ObjectRef> {
        let mut writer = self.store.begin_write().await?;

        for chunk in task.chunk_plan.chunks() {
            let data = match read_staged(&self.staging, chunk.index).await {
                Ok(data) => data,
                Err(e) => {
                    writer.abort().await?;
                    return Err(e);
                }
            };
            if let Err(e) = writer.write(&data).await {
                writer.abort().await?;
                return Err(e.into());
            }
        }

        let actual = writer.current_hash();
        if actual != task.expected_digest {
            writer.abort().await?;
            return Err(TransferError::IntegrityMismatch {
                expected: task.expected_digest.to_hex(),
                actual: actual.to_hex(),
            });
        }

        Ok(self.store.commit(writer).await?)
    }
}

async fn remove_staging(dir: &Path, task_id: &str) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed staging for task {}", task_id),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staging {:?}: {}", dir, e),
    }
}

async fn read_staged(dir: &Path, index: u32) -> Result<Vec<u8>> {
    let chunk_path = dir.join(index.to_string());
    match fs::read(&chunk_path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TransferError::InvalidState(
            format!("staged chunk {} is missing", index),
        )),
        Err(e) => Err(e.into()),
    }
}
