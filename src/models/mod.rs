pub mod folder;
pub mod log;
pub mod task;

pub use folder::{Folder, FolderStatus};
pub use log::LogEntry;
pub use task::{Task, TaskId, TaskPatch, TaskStatus};
