use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::progress::ProgressSnapshot;

pub type TaskId = String;

/// A concrete unit of work: one local file, one remote directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(rename = "uid")]
    pub id: TaskId,
    pub folder_id: String,
    pub name: String,
    pub file_name: String,
    /// Canonical (symlink-resolved) absolute path. Unique per store.
    pub local_path: String,
    pub remote_path: String,
    pub origin: String,
    pub file_size: String,
    pub status: TaskStatus,
    pub progress: String,
    pub current: Option<String>,
    pub total: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub logs: String,
    /// Free-form rclone flags that override the defaults for this task only.
    pub flags: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<String>,
}

impl Task {
    pub fn new(
        folder_id: impl Into<String>,
        name: impl Into<String>,
        file_name: impl Into<String>,
        local_path: impl Into<String>,
        remote_path: impl Into<String>,
        origin: impl Into<String>,
        file_size: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            folder_id: folder_id.into(),
            name: name.into(),
            file_name: file_name.into(),
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            origin: origin.into(),
            file_size: file_size.into(),
            status: TaskStatus::Pending,
            progress: "0".into(),
            current: None,
            total: None,
            speed: None,
            eta: None,
            logs: String::new(),
            flags: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration: None,
        }
    }

    /// `origin:remote_path`, the copy destination handed to rclone.
    pub fn remote_target(&self) -> String {
        format!("{}:{}", self.origin, self.remote_path)
    }
}

/// Stored as its integer code so existing dashboards can keep filtering on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl From<TaskStatus> for u8 {
    fn from(status: TaskStatus) -> u8 {
        match status {
            TaskStatus::Pending => 0,
            TaskStatus::Queued => 1,
            TaskStatus::Running => 2,
            TaskStatus::Succeeded => 3,
            TaskStatus::Failed => 4,
        }
    }
}

impl TryFrom<u8> for TaskStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(TaskStatus::Pending),
            1 => Ok(TaskStatus::Queued),
            2 => Ok(TaskStatus::Running),
            3 => Ok(TaskStatus::Succeeded),
            4 => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status code {other}")),
        }
    }
}

/// Partial update of a task record. `None` fields are left alone;
/// `append_log` is concatenated onto the existing log, never overwriting it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<String>,
    pub current: Option<String>,
    pub total: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<String>,
    pub append_log: Option<String>,
}

impl TaskPatch {
    pub fn log(line: impl Into<String>) -> Self {
        Self { append_log: Some(line.into()), ..Self::default() }
    }

    pub fn with_progress(mut self, snapshot: &ProgressSnapshot) -> Self {
        self.current = Some(snapshot.current.clone());
        self.total = Some(snapshot.total.clone());
        self.progress = Some(snapshot.percent.clone());
        self.speed = Some(snapshot.speed.clone());
        self.eta = Some(snapshot.eta.clone());
        self
    }

    /// Apply to an in-memory record. Used by stores without native partial updates.
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(progress) = &self.progress {
            task.progress = progress.clone();
        }
        if self.current.is_some() {
            task.current = self.current.clone();
        }
        if self.total.is_some() {
            task.total = self.total.clone();
        }
        if self.speed.is_some() {
            task.speed = self.speed.clone();
        }
        if self.eta.is_some() {
            task.eta = self.eta.clone();
        }
        if self.started_at.is_some() {
            task.started_at = self.started_at;
        }
        if self.finished_at.is_some() {
            task.finished_at = self.finished_at;
        }
        if self.duration.is_some() {
            task.duration = self.duration.clone();
        }
        if let Some(delta) = &self.append_log {
            task.logs.push_str(delta);
        }
    }
}
