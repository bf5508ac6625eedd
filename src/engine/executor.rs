use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, error, info, warn};

use crate::{
	engine::{
		pool::JobHandler,
		progress::{self, ProgressSnapshot},
		rclone::{spawn_error, Rclone},
	},
	models::{LogEntry, Task, TaskId, TaskPatch, TaskStatus},
	store::{JobStore, StoreError},
	util::format_duration,
};

/// Appended to the task log when rclone exits cleanly.
pub const SUCCESS_MARKER: &str = "rclone command succeeded";

/// Stderr lines are stored with this prefix so the UI can highlight them.
pub const STDERR_PREFIX: &str = "error::::";

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Runs one transfer job to completion: spawn rclone, stream its output into
/// the task record, settle the final status.
pub struct TransferExecutor {
	store: Arc<dyn JobStore>,
	rclone: Rclone,
	echo: bool,
}

impl TransferExecutor {
	pub fn new(store: Arc<dyn JobStore>, rclone: Rclone) -> Self {
		Self { store, rclone, echo: true }
	}

	/// Stop mirroring rclone output onto our own stdout/stderr.
	pub fn without_echo(mut self) -> Self {
		self.echo = false;
		self
	}

	/// Execute a single task. Returns the terminal status, or `None` when the
	/// task vanished or had already finished.
	///
	/// Tool failures end in `Failed`; only store errors are returned.
	pub async fn execute(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError> {
		// 1. Load task
		let Some(task) = self.store.get_task(task_id).await? else {
			debug!(task_id, "task disappeared before execution");
			return Ok(None);
		};
		if task.status.is_terminal() {
			debug!(task_id, status = task.status.label(), "task already finished, skipping");
			return Ok(None);
		}

		// 2. Transition to running
		let started = Utc::now();
		self.store
			.update_task(
				task_id,
				&TaskPatch { status: Some(TaskStatus::Running), started_at: Some(started), ..TaskPatch::default() },
			)
			.await?;

		// 3. Build the command line
		let command = match self.rclone.copy_command(&task) {
			Ok(c) => c,
			Err(e) => return self.finish(&task, started, TaskStatus::Failed, e.to_string(), None).await.map(Some),
		};
		let display = command.display();
		info!(task_id, file = %task.local_path, "starting transfer");
		self.store.update_task(task_id, &TaskPatch::log(format!("running: {display}\n"))).await?;

		// 4. Spawn and drain both pipes concurrently
		let mut child = match command.command().spawn() {
			Ok(child) => child,
			Err(e) => {
				let err = spawn_error(e, &command.program);
				return self.finish(&task, started, TaskStatus::Failed, err.to_string(), None).await.map(Some);
			}
		};

		let reporter = Arc::new(Reporter::new(self.store.clone(), task.id.clone(), self.echo));
		let readers = [
			child.stdout.take().map(|out| tokio::spawn(drain(out, Stream::Stdout, reporter.clone()))),
			child.stderr.take().map(|err| tokio::spawn(drain(err, Stream::Stderr, reporter.clone()))),
		];

		let exit = child.wait().await;

		// 5. All output must be in the store before the final status lands.
		for reader in readers.into_iter().flatten() {
			if let Err(e) = reader.await {
				warn!(task_id, "output reader panicked: {e}");
			}
		}

		let (status, line) = match exit {
			Ok(exit) if exit.success() => (TaskStatus::Succeeded, SUCCESS_MARKER.to_string()),
			Ok(exit) => {
				let reason = match exit.code() {
					Some(code) => format!("exit code {code}"),
					None => "termination by signal".to_string(),
				};
				(TaskStatus::Failed, format!("rclone command failed with {reason}: {display}"))
			}
			Err(e) => (TaskStatus::Failed, format!("failed waiting for rclone: {e}: {display}")),
		};

		self.finish(&task, started, status, line, reporter.latest()).await.map(Some)
	}

	async fn finish(
		&self,
		task: &Task,
		started: DateTime<Utc>,
		status: TaskStatus,
		line: String,
		latest: Option<ProgressSnapshot>,
	) -> Result<TaskStatus, StoreError> {
		let finished = Utc::now();
		let duration = format_duration(finished - started);

		let mut patch = TaskPatch {
			status: Some(status),
			finished_at: Some(finished),
			duration: Some(duration.clone()),
			append_log: Some(format!("{line}\n")),
			..TaskPatch::default()
		};
		// Throttling may have held back the last reading.
		if let Some(snapshot) = &latest {
			patch = patch.with_progress(snapshot);
		}
		if status == TaskStatus::Succeeded {
			patch.progress = Some("100".into());
		}
		self.store.update_task(&task.id, &patch).await?;

		let target = format!("{} -> {}", task.local_path, task.remote_target());
		if status == TaskStatus::Succeeded {
			info!(task_id = %task.id, %duration, "transfer succeeded");
		} else {
			warn!(task_id = %task.id, %duration, reason = %line, "transfer failed");
		}

		let entry = match status {
			TaskStatus::Succeeded => LogEntry::new("upload succeeded", format!("{target} finished in {duration}")),
			_ => LogEntry::new("upload failed", format!("{target}: {line}")),
		};
		if let Err(e) = self.store.add_log(&entry).await {
			warn!(task_id = %task.id, "failed to write audit log: {e}");
		}

		Ok(status)
	}
}

#[async_trait]
impl JobHandler for TransferExecutor {
	async fn handle(&self, task_id: TaskId) {
		if let Err(e) = self.execute(&task_id).await {
			error!(%task_id, "transfer aborted: {e}");
		}
	}
}

#[derive(Debug, Clone, Copy)]
enum Stream {
	Stdout,
	Stderr,
}

/// Funnels output lines from both readers into the task record.
///
/// Log appends go through one async lock so the two streams never issue
/// overlapping updates on the same record.
struct Reporter {
	store: Arc<dyn JobStore>,
	task_id: TaskId,
	echo: bool,
	last_progress: Mutex<Option<Instant>>,
	latest: Mutex<Option<ProgressSnapshot>>,
	write: tokio::sync::Mutex<()>,
}

impl Reporter {
	fn new(store: Arc<dyn JobStore>, task_id: TaskId, echo: bool) -> Self {
		Self { store, task_id, echo, last_progress: Mutex::new(None), latest: Mutex::new(None), write: tokio::sync::Mutex::new(()) }
	}

	async fn line(&self, stream: Stream, line: &str) {
		let patch = match stream {
			Stream::Stdout => {
				if self.echo {
					println!("{line}");
				}
				let patch = TaskPatch::log(format!("{line}\n"));
				match progress::parse(line) {
					Some(snapshot) => {
						let due = self.progress_due();
						let patch = if due { patch.with_progress(&snapshot) } else { patch };
						*self.latest.lock() = Some(snapshot);
						patch
					}
					None => patch,
				}
			}
			Stream::Stderr => {
				if self.echo {
					eprintln!("{line}");
				}
				TaskPatch::log(format!("{STDERR_PREFIX}{line}\n"))
			}
		};

		let _guard = self.write.lock().await;
		if let Err(e) = self.store.update_task(&self.task_id, &patch).await {
			warn!(task_id = %self.task_id, "failed to record rclone output: {e}");
		}
	}

	fn latest(&self) -> Option<ProgressSnapshot> {
		self.latest.lock().clone()
	}

	/// At most one progress-field write per interval.
	fn progress_due(&self) -> bool {
		let mut last = self.last_progress.lock();
		match *last {
			Some(at) if at.elapsed() < PROGRESS_INTERVAL => false,
			_ => {
				*last = Some(Instant::now());
				true
			}
		}
	}
}

async fn drain<R>(reader: R, stream: Stream, reporter: Arc<Reporter>)
where
	R: AsyncRead + Unpin,
{
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) => break,
			Ok(_) => {
				let text = String::from_utf8_lossy(&buf);
				// rclone redraws its progress block with carriage returns.
				for line in text.split(|c| c == '\r' || c == '\n') {
					if !line.trim().is_empty() {
						reporter.line(stream, line.trim_end()).await;
					}
				}
			}
			Err(e) => {
				warn!(task_id = %reporter.task_id, ?stream, "output read failed: {e}");
				break;
			}
		}
	}
}
