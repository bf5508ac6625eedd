use std::{
	fs,
	path::{Path, PathBuf},
	sync::Arc,
};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
	engine::rclone::Rclone,
	models::{Folder, Task, TaskStatus},
	store::{JobStore, StoreError},
	util::format_size,
};

#[derive(Debug, Error)]
pub enum ScanError {
	#[error("database error: {0}")]
	DbError(#[from] StoreError),

	#[error("walk task failed: {0}")]
	Join(String),
}

/// Everything a scan needs to know about one sync root.
#[derive(Debug, Clone)]
pub struct ScanTarget {
	pub local_root: PathBuf,
	pub max_depth: usize,
	pub folder_id: String,
	pub folder_name: String,
	pub remote_root: String,
	pub origin: String,
}

impl From<&Folder> for ScanTarget {
	fn from(folder: &Folder) -> Self {
		Self {
			local_root: PathBuf::from(&folder.local_path),
			max_depth: folder.max_depth,
			folder_id: folder.id.clone(),
			folder_name: folder.name.clone(),
			remote_root: folder.remote_path.clone(),
			origin: folder.origin.clone(),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
	pub files_found: u64,
	pub tasks_created: u64,
	pub already_tracked: u64,
	pub skipped_entries: u64,
}

#[derive(Debug)]
struct FileEntry {
	/// Symlink-resolved absolute path; the dedup key.
	canonical: String,
	relative: PathBuf,
	file_name: String,
	size: u64,
}

pub struct Scanner {
	store: Arc<dyn JobStore>,
	rclone: Rclone,
}

impl Scanner {
	pub fn new(store: Arc<dyn JobStore>, rclone: Rclone) -> Self {
		Self { store, rclone }
	}

	/// Walk a sync root and create a task for every file not already tracked.
	///
	/// Filesystem problems are logged and skipped; only store failures are
	/// returned.
	pub async fn scan(&self, target: &ScanTarget) -> Result<ScanReport, ScanError> {
		if !target.local_root.exists() {
			warn!(path = %target.local_root.display(), "scan root does not exist");
			return Ok(ScanReport::default());
		}

		// Walk filesystem (blocking — offload to thread pool)
		let (entries, skipped) = tokio::task::spawn_blocking({
			let root = target.local_root.clone();
			let max_depth = target.max_depth;
			move || walk_source(&root, max_depth)
		})
		.await
		.map_err(|e| ScanError::Join(e.to_string()))?;

		let mut report = ScanReport {
			files_found: entries.len() as u64,
			skipped_entries: skipped,
			..ScanReport::default()
		};

		for entry in &entries {
			if self.create_task_if_needed(target, entry).await? {
				report.tasks_created += 1;
			} else {
				report.already_tracked += 1;
			}
		}

		info!(
			folder = %target.folder_name,
			files = report.files_found,
			created = report.tasks_created,
			skipped = report.skipped_entries,
			"scan finished"
		);
		Ok(report)
	}

	/// Returns whether a new task was inserted.
	async fn create_task_if_needed(&self, target: &ScanTarget, entry: &FileEntry) -> Result<bool, ScanError> {
		if self.store.find_task_by_path(&entry.canonical).await?.is_some() {
			return Ok(false);
		}

		let remote_dir = remote_dir(&entry.relative, &target.remote_root);
		let remote_file = if remote_dir.is_empty() {
			entry.file_name.clone()
		} else {
			format!("{}/{}", remote_dir.trim_end_matches('/'), entry.file_name)
		};
		let on_remote = match self.rclone.exists(&format!("{}:{remote_file}", target.origin)).await {
			Ok(found) => found,
			Err(e) => {
				warn!(file = %entry.canonical, "remote existence check failed: {e}");
				false
			}
		};

		let mut task = Task::new(
			&target.folder_id,
			&target.folder_name,
			&entry.file_name,
			&entry.canonical,
			remote_dir,
			&target.origin,
			format_size(entry.size),
		);
		if on_remote {
			task.status = TaskStatus::Succeeded;
			task.progress = "100".into();
		}

		match self.store.insert_task(&task).await {
			Ok(()) => {
				debug!(file = %entry.canonical, status = task.status.label(), "task created");
				Ok(true)
			}
			// Lost a race with a concurrent scan; the other one owns it.
			Err(StoreError::Duplicate(_)) => Ok(false),
			Err(e) => Err(e.into()),
		}
	}
}

/// Editor backups and dotfiles never become tasks.
fn is_noise(file_name: &str) -> bool {
	file_name.starts_with('.') || file_name.ends_with('~')
}

/// Remote directory for a file: `parent(remote_root / relative)`, `/`-separated.
fn remote_dir(relative: &Path, remote_root: &str) -> String {
	let relative = relative.to_string_lossy().replace('\\', "/");
	let joined = if remote_root.is_empty() {
		relative
	} else {
		format!("{}/{relative}", remote_root.trim_end_matches('/'))
	};

	match joined.rfind('/') {
		Some(0) => "/".to_string(),
		Some(idx) => joined[..idx].to_string(),
		None => String::new(),
	}
}

/// Depth-first walk. A directory `n` separators below the root is listed
/// only while `n <= max_depth`; deeper subtrees are pruned, not fatal.
fn walk_source(root: &Path, max_depth: usize) -> (Vec<FileEntry>, u64) {
	let mut entries = Vec::new();
	let mut skipped = 0u64;

	// Files sit one level below the directory that lists them.
	let walk_depth = max_depth.saturating_add(1);
	for result in WalkDir::new(root).follow_links(false).max_depth(walk_depth) {
		let entry = match result {
			Ok(e) => e,
			Err(e) => {
				warn!(root = %root.display(), "walk error: {e}");
				skipped += 1;
				continue;
			}
		};

		if entry.file_type().is_dir() {
			if entry.depth() == walk_depth {
				debug!(path = %entry.path().display(), max_depth, "max depth reached, not descending");
			}
			continue;
		}

		let file_name = entry.file_name().to_string_lossy().into_owned();
		if is_noise(&file_name) {
			skipped += 1;
			continue;
		}

		// Follows symlinks: a link to a file counts, a link to a directory does not.
		let metadata = match fs::metadata(entry.path()) {
			Ok(m) if m.is_file() => m,
			Ok(_) => {
				skipped += 1;
				continue;
			}
			Err(e) => {
				warn!(path = %entry.path().display(), "stat failed: {e}");
				skipped += 1;
				continue;
			}
		};

		let canonical = match fs::canonicalize(entry.path()) {
			Ok(p) => p.to_string_lossy().into_owned(),
			Err(e) => {
				warn!(path = %entry.path().display(), "cannot resolve path: {e}");
				skipped += 1;
				continue;
			}
		};

		let relative = match entry.path().strip_prefix(root) {
			Ok(rel) => rel.to_path_buf(),
			Err(_) => {
				skipped += 1;
				continue;
			}
		};

		entries.push(FileEntry { canonical, relative, file_name, size: metadata.len() });
	}

	(entries, skipped)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{engine::rclone::testing::fake_rclone, store::MemoryStore};

	/// Remote holds nothing except paths containing "uploaded".
	const REMOTE: &str = "case \"$2\" in *uploaded*) echo \"${2##*/}\" ;; esac\n";

	fn setup(tmp: &Path) -> (Arc<MemoryStore>, Scanner) {
		let store = Arc::new(MemoryStore::new());
		let scanner = Scanner::new(store.clone(), fake_rclone(tmp, REMOTE));
		(store, scanner)
	}

	fn target(root: &Path, max_depth: usize) -> ScanTarget {
		ScanTarget {
			local_root: root.to_path_buf(),
			max_depth,
			folder_id: "folder-1".into(),
			folder_name: "a".into(),
			remote_root: "r/a".into(),
			origin: "gdrive".into(),
		}
	}

	#[tokio::test]
	async fn single_new_file_becomes_pending_task() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("a");
		fs::create_dir_all(&root).unwrap();
		fs::write(root.join("x.txt"), "0123456789").unwrap();
		let (store, scanner) = setup(tmp.path());

		let report = scanner.scan(&target(&root, 2)).await.unwrap();

		assert_eq!(report.tasks_created, 1);
		let tasks = store.tasks();
		assert_eq!(tasks.len(), 1);
		let task = &tasks[0];
		assert_eq!(task.status, TaskStatus::Pending);
		assert_eq!(task.progress, "0");
		assert_eq!(task.file_size, "10B");
		assert_eq!(task.remote_path, "r/a");
		assert_eq!(task.file_name, "x.txt");
		assert_eq!(task.folder_id, "folder-1");
		let expected = fs::canonicalize(root.join("x.txt")).unwrap();
		assert_eq!(task.local_path, expected.to_string_lossy());
	}

	#[tokio::test]
	async fn rescan_is_idempotent() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("tree");
		fs::create_dir_all(root.join("sub")).unwrap();
		fs::write(root.join("one.txt"), "1").unwrap();
		fs::write(root.join("sub/two.txt"), "22").unwrap();
		let (store, scanner) = setup(tmp.path());

		let first = scanner.scan(&target(&root, 5)).await.unwrap();
		let second = scanner.scan(&target(&root, 5)).await.unwrap();

		assert_eq!(first.tasks_created, 2);
		assert_eq!(second.tasks_created, 0);
		assert_eq!(second.already_tracked, 2);
		assert_eq!(store.tasks().len(), 2);
	}

	#[tokio::test]
	async fn depth_bound_is_inclusive() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("tree");
		fs::create_dir_all(root.join("d1/d2")).unwrap();
		fs::write(root.join("top.txt"), "t").unwrap();
		fs::write(root.join("d1/at_depth.txt"), "a").unwrap();
		fs::write(root.join("d1/d2/too_deep.txt"), "b").unwrap();
		let (store, scanner) = setup(tmp.path());

		scanner.scan(&target(&root, 1)).await.unwrap();

		let mut names: Vec<String> = store.tasks().into_iter().map(|t| t.file_name).collect();
		names.sort();
		assert_eq!(names, vec!["at_depth.txt", "top.txt"]);
	}

	#[tokio::test]
	async fn noise_files_are_ignored() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("tree");
		fs::create_dir_all(&root).unwrap();
		fs::write(root.join(".DS_Store"), "x").unwrap();
		fs::write(root.join("backup~"), "x").unwrap();
		fs::write(root.join("real.txt"), "x").unwrap();
		let (store, scanner) = setup(tmp.path());

		let report = scanner.scan(&target(&root, 3)).await.unwrap();

		assert_eq!(report.skipped_entries, 2);
		let tasks = store.tasks();
		assert_eq!(tasks.len(), 1);
		assert_eq!(tasks[0].file_name, "real.txt");
	}

	#[tokio::test]
	async fn already_uploaded_file_starts_succeeded() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("tree");
		fs::create_dir_all(root.join("nested")).unwrap();
		fs::write(root.join("nested/uploaded.bin"), vec![0u8; 2048]).unwrap();
		let (store, scanner) = setup(tmp.path());

		scanner.scan(&target(&root, 3)).await.unwrap();

		let task = &store.tasks()[0];
		assert_eq!(task.status, TaskStatus::Succeeded);
		assert_eq!(task.progress, "100");
		assert_eq!(task.remote_path, "r/a/nested");
		assert_eq!(task.file_size, "2.0KB");
	}

	#[tokio::test]
	async fn symlinks_dedup_on_resolved_path() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("tree");
		fs::create_dir_all(&root).unwrap();
		fs::write(root.join("target.txt"), "abc").unwrap();
		std::os::unix::fs::symlink(root.join("target.txt"), root.join("link.txt")).unwrap();
		let (store, scanner) = setup(tmp.path());

		let report = scanner.scan(&target(&root, 3)).await.unwrap();

		assert_eq!(report.files_found, 2);
		assert_eq!(report.tasks_created, 1);
		assert_eq!(store.tasks().len(), 1);
	}

	#[tokio::test]
	async fn missing_root_is_a_no_op() {
		let tmp = tempfile::tempdir().unwrap();
		let (store, scanner) = setup(tmp.path());

		let report = scanner.scan(&target(&tmp.path().join("nope"), 3)).await.unwrap();

		assert_eq!(report, ScanReport::default());
		assert!(store.tasks().is_empty());
	}

	#[tokio::test]
	async fn unbounded_depth_walks_everything() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("a");
		fs::create_dir_all(root.join("d1/d2")).unwrap();
		fs::write(root.join("x.txt"), "x").unwrap();
		fs::write(root.join("d1/d2/deep.txt"), "y").unwrap();
		let (store, scanner) = setup(tmp.path());

		let report = scanner.scan(&target(&root, usize::MAX)).await.unwrap();

		assert_eq!(report.tasks_created, 2);
		assert_eq!(store.tasks().len(), 2);
	}

	#[test]
	fn remote_dir_joins_and_normalizes() {
		assert_eq!(remote_dir(Path::new("x.txt"), "r/a"), "r/a");
		assert_eq!(remote_dir(Path::new("sub/x.txt"), "r/a/"), "r/a/sub");
		assert_eq!(remote_dir(Path::new("x.txt"), ""), "");
		assert_eq!(remote_dir(Path::new("sub/x.txt"), ""), "sub");
		assert_eq!(remote_dir(Path::new("x.txt"), "/"), "/");
	}

	#[test]
	fn noise_names() {
		assert!(is_noise(".DS_Store"));
		assert!(is_noise("notes.txt~"));
		assert!(!is_noise("notes.txt"));
		assert!(!is_noise("a.b"));
	}
}
