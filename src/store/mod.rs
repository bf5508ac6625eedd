//! Persistence seam for folders, tasks and the audit log.
//!
//! Every mutation is a single-record, single-statement update. Callers never
//! hold a lock across store calls; atomicity is whatever the backing store
//! gives a single-document write.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Folder, FolderStatus, LogEntry, Task, TaskPatch, TaskStatus};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
	/// Unique index on `local_path` rejected the insert.
	#[error("task already exists for local path: {0}")]
	Duplicate(String),

	#[error("record not found: {0}")]
	NotFound(String),

	#[error("malformed record: {0}")]
	Decode(String),

	#[error("database error: {0}")]
	DbError(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
	pub folders_reset: u64,
	pub tasks_reset: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
	async fn insert_folder(&self, folder: &Folder) -> Result<(), StoreError>;

	async fn get_folder(&self, id: &str) -> Result<Option<Folder>, StoreError>;

	async fn find_folders(&self, status: FolderStatus) -> Result<Vec<Folder>, StoreError>;

	/// Compare-and-set on folder status. Returns whether the record changed.
	async fn transition_folder(&self, id: &str, from: FolderStatus, to: FolderStatus) -> Result<bool, StoreError>;

	/// Mark a scan finished: status back to watching, `last_sync_at` stamped.
	async fn finish_folder_scan(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

	async fn count_folders(&self) -> Result<u64, StoreError>;

	/// Fails with [`StoreError::Duplicate`] when a task for the same local path exists.
	async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

	async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

	async fn find_task_by_path(&self, local_path: &str) -> Result<Option<Task>, StoreError>;

	/// Tasks in the given status, oldest first.
	async fn find_tasks(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError>;

	async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<(), StoreError>;

	/// Compare-and-set on task status. Returns whether the record changed.
	async fn transition_task(&self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<bool, StoreError>;

	async fn count_tasks(&self, status: Option<TaskStatus>) -> Result<u64, StoreError>;

	async fn add_log(&self, entry: &LogEntry) -> Result<(), StoreError>;

	/// Newest first.
	async fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError>;

	/// Undo state left behind by a process that died mid-scan or mid-transfer:
	/// scanning folders go back to watching, queued/running tasks to pending.
	async fn recover_interrupted(&self) -> Result<RecoveryReport, StoreError>;
}
