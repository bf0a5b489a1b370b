use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use udisk_chunker::{ChunkPlan, ContentHash};

/// Lifecycle of a transfer task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Planned, no chunk moved yet
    Pending,
    /// At least one chunk accepted or served
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and Failed tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Small,
    Regular,
    Large,
}

impl SizeCategory {
    /// `Small` below `small_threshold`, `Large` at or above `large_threshold`
    pub fn classify(size: u64, small_threshold: u64, large_threshold: u64) -> Self {
        if size >= large_threshold {
            SizeCategory::Large
        } else if size < small_threshold {
            SizeCategory::Small
        } else {
            SizeCategory::Regular
        }
    }
}

/// Snapshot of one transfer task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner: String,
    pub direction: Direction,
    pub category: SizeCategory,
    pub status: TaskStatus,
    pub target_path: String,
    pub expected_digest: ContentHash,
    pub total_size: u64,
    pub chunk_plan: ChunkPlan,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new(
        owner: String,
        direction: Direction,
        category: SizeCategory,
        target_path: String,
        expected_digest: ContentHash,
        chunk_plan: ChunkPlan,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner,
            direction,
            category,
            status: TaskStatus::Pending,
            target_path,
            expected_digest,
            total_size: chunk_plan.total_size(),
            chunk_plan,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.set_status(TaskStatus::Failed);
    }

    /// Move a Pending task to InProgress; other states are left alone.
    pub(crate) fn mark_started(&mut self) {
        if self.status == TaskStatus::Pending {
            self.set_status(TaskStatus::InProgress);
        }
    }
}
