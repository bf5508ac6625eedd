use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_DEPTH: usize = 10;

/// A registered sync root: "files under here go to origin:remote_path".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Folder {
    #[serde(rename = "uid")]
    pub id: String,
    pub name: String,
    pub local_path: String,
    pub remote_path: String,
    pub origin: String,
    pub max_depth: usize,
    pub status: FolderStatus,
    pub created_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Folder {
    pub fn new(
        name: impl Into<String>,
        local_path: impl Into<String>,
        remote_path: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            name: name.into(),
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            origin: origin.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            status: FolderStatus::Unscanned,
            created_at: Utc::now(),
            last_sync_at: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(into = "u8", try_from = "u8")]
pub enum FolderStatus {
    Unscanned,
    Scanning,
    Watching,
}

impl FolderStatus {
    pub fn label(self) -> &'static str {
        match self {
            FolderStatus::Unscanned => "unscanned",
            FolderStatus::Scanning => "scanning",
            FolderStatus::Watching => "watching",
        }
    }
}

impl From<FolderStatus> for u8 {
    fn from(status: FolderStatus) -> u8 {
        match status {
            FolderStatus::Unscanned => 0,
            FolderStatus::Scanning => 1,
            FolderStatus::Watching => 2,
        }
    }
}

impl TryFrom<u8> for FolderStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(FolderStatus::Unscanned),
            1 => Ok(FolderStatus::Scanning),
            2 => Ok(FolderStatus::Watching),
            other => Err(format!("unknown folder status code {other}")),
        }
    }
}
