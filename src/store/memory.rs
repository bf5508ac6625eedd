use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{JobStore, RecoveryReport, StoreError};
use crate::models::{Folder, FolderStatus, LogEntry, Task, TaskPatch, TaskStatus};

/// In-process store. Backs tests and `--memory` runs.
///
/// Records live in insertion order, which doubles as creation order.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	folders: Vec<Folder>,
	tasks: Vec<Task>,
	logs: Vec<LogEntry>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Snapshot of every task, for assertions.
	pub fn tasks(&self) -> Vec<Task> {
		self.inner.lock().tasks.clone()
	}

	pub fn logs(&self) -> Vec<LogEntry> {
		self.inner.lock().logs.clone()
	}
}

#[async_trait]
impl JobStore for MemoryStore {
	async fn insert_folder(&self, folder: &Folder) -> Result<(), StoreError> {
		self.inner.lock().folders.push(folder.clone());
		Ok(())
	}

	async fn get_folder(&self, id: &str) -> Result<Option<Folder>, StoreError> {
		Ok(self.inner.lock().folders.iter().find(|f| f.id == id).cloned())
	}

	async fn find_folders(&self, status: FolderStatus) -> Result<Vec<Folder>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.folders.iter().filter(|f| f.status == status).cloned().collect())
	}

	async fn transition_folder(&self, id: &str, from: FolderStatus, to: FolderStatus) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		match inner.folders.iter_mut().find(|f| f.id == id && f.status == from) {
			Some(folder) => {
				folder.status = to;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn finish_folder_scan(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		let folder = inner
			.folders
			.iter_mut()
			.find(|f| f.id == id)
			.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
		folder.status = FolderStatus::Watching;
		folder.last_sync_at = Some(at);
		Ok(())
	}

	async fn count_folders(&self) -> Result<u64, StoreError> {
		Ok(self.inner.lock().folders.len() as u64)
	}

	async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		if inner.tasks.iter().any(|t| t.local_path == task.local_path) {
			return Err(StoreError::Duplicate(task.local_path.clone()));
		}
		inner.tasks.push(task.clone());
		Ok(())
	}

	async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
		Ok(self.inner.lock().tasks.iter().find(|t| t.id == id).cloned())
	}

	async fn find_task_by_path(&self, local_path: &str) -> Result<Option<Task>, StoreError> {
		Ok(self.inner.lock().tasks.iter().find(|t| t.local_path == local_path).cloned())
	}

	async fn find_tasks(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.tasks.iter().filter(|t| t.status == status).cloned().collect())
	}

	async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		let task = inner
			.tasks
			.iter_mut()
			.find(|t| t.id == id)
			.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
		patch.apply(task);
		Ok(())
	}

	async fn transition_task(&self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		match inner.tasks.iter_mut().find(|t| t.id == id && t.status == from) {
			Some(task) => {
				task.status = to;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn count_tasks(&self, status: Option<TaskStatus>) -> Result<u64, StoreError> {
		let inner = self.inner.lock();
		let count = match status {
			Some(status) => inner.tasks.iter().filter(|t| t.status == status).count(),
			None => inner.tasks.len(),
		};
		Ok(count as u64)
	}

	async fn add_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
		self.inner.lock().logs.push(entry.clone());
		Ok(())
	}

	async fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.logs.iter().rev().take(limit).cloned().collect())
	}

	async fn recover_interrupted(&self) -> Result<RecoveryReport, StoreError> {
		let mut inner = self.inner.lock();
		let mut report = RecoveryReport::default();

		for folder in inner.folders.iter_mut().filter(|f| f.status == FolderStatus::Scanning) {
			folder.status = FolderStatus::Watching;
			report.folders_reset += 1;
		}
		for task in inner
			.tasks
			.iter_mut()
			.filter(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Running))
		{
			task.status = TaskStatus::Pending;
			report.tasks_reset += 1;
		}

		Ok(report)
	}
}
