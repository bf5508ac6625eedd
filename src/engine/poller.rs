//! The two periodic drivers: the folder loop (find folders due for a scan,
//! scan them) and the queue feeder (push pending tasks into the worker pool).
//!
//! Each loop is a ticker plus a "do one round" method. A failed round is
//! logged and the next tick runs as usual.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tokio::{
	sync::watch,
	time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
	engine::{
		pool::{PoolError, WorkerPool},
		scanner::{ScanError, ScanTarget, Scanner},
	},
	models::{FolderStatus, LogEntry, TaskStatus},
	store::{JobStore, RecoveryReport, StoreError},
};

#[derive(Debug, Error)]
pub enum PollError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Scan(#[from] ScanError),

	#[error(transparent)]
	Pool(#[from] PoolError),
}

/// Owns the poll loops and the worker pool they feed.
pub struct Supervisor {
	store: Arc<dyn JobStore>,
	scanner: Scanner,
	pool: Arc<WorkerPool>,
	delay: Duration,
}

/// The folder loop alternates targets so watched folders get rescanned too.
pub fn next_target(current: FolderStatus) -> FolderStatus {
	match current {
		FolderStatus::Unscanned => FolderStatus::Watching,
		_ => FolderStatus::Unscanned,
	}
}

impl Supervisor {
	pub fn new(store: Arc<dyn JobStore>, scanner: Scanner, pool: Arc<WorkerPool>, delay: Duration) -> Self {
		Self { store, scanner, pool, delay }
	}

	pub fn pool(&self) -> &Arc<WorkerPool> {
		&self.pool
	}

	/// Reset state a previous process left mid-flight.
	pub async fn recover(&self) -> Result<RecoveryReport, StoreError> {
		let report = self.store.recover_interrupted().await?;
		if report.folders_reset > 0 || report.tasks_reset > 0 {
			info!(folders = report.folders_reset, tasks = report.tasks_reset, "recovered interrupted work");
		}
		Ok(report)
	}

	/// Scan every folder currently in `target` status. Returns how many
	/// folders were scanned.
	pub async fn scan_once(&self, target: FolderStatus) -> Result<u64, PollError> {
		let folders = self.store.find_folders(target).await?;
		let mut scanned = 0;

		for folder in folders {
			// Somebody else picked it up between the find and now.
			if !self.store.transition_folder(&folder.id, target, FolderStatus::Scanning).await? {
				debug!(folder = %folder.name, "folder already claimed, skipping");
				continue;
			}

			let result = self.scanner.scan(&ScanTarget::from(&folder)).await;
			self.store.finish_folder_scan(&folder.id, Utc::now()).await?;
			let report = result?;
			scanned += 1;

			let entry = LogEntry::new(
				"folder scan",
				format!(
					"scanned folder {} ({}), {} new tasks",
					folder.name, folder.local_path, report.tasks_created
				),
			);
			if let Err(e) = self.store.add_log(&entry).await {
				warn!(folder = %folder.name, "failed to write audit log: {e}");
			}
		}

		Ok(scanned)
	}

	/// Move every pending task into the worker queue. Returns how many were queued.
	pub async fn feed_once(&self) -> Result<u64, PollError> {
		let pending = self.store.find_tasks(TaskStatus::Pending).await?;
		let mut queued = 0;

		for task in pending {
			// Flip first: a fast worker's RUNNING write must never be overwritten by QUEUED.
			if !self.store.transition_task(&task.id, TaskStatus::Pending, TaskStatus::Queued).await? {
				continue;
			}
			if let Err(e) = self.pool.submit(task.id.clone()) {
				self.store.transition_task(&task.id, TaskStatus::Queued, TaskStatus::Pending).await?;
				return Err(e.into());
			}
			queued += 1;
		}

		if queued > 0 {
			info!(queued, "tasks queued");
		}
		Ok(queued)
	}

	/// Run both loops until `shutdown` flips (or its sender drops), then
	/// drain the worker pool.
	pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
		if let Err(e) = self.recover().await {
			error!("startup recovery failed: {e}");
		}

		let folders = tokio::spawn(self.clone().folder_loop(shutdown.clone()));
		let feeder = tokio::spawn(self.clone().feed_loop(shutdown));

		for (name, handle) in [("folder", folders), ("feeder", feeder)] {
			if let Err(e) = handle.await {
				error!(loop_name = name, "poll loop exited abnormally: {e}");
			}
		}

		self.pool.shutdown().await;
	}

	async fn folder_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = interval(self.delay);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut target = FolderStatus::Unscanned;

		loop {
			tokio::select! {
				_ = ticker.tick() => {}
				_ = shutdown.changed() => break,
			}

			match self.scan_once(target).await {
				Ok(n) => debug!(status = target.label(), scanned = n, "folder tick done"),
				Err(e) => error!(status = target.label(), "folder tick failed: {e}"),
			}
			target = next_target(target);
		}
		debug!("folder loop stopped");
	}

	async fn feed_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = interval(self.delay);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = ticker.tick() => {}
				_ = shutdown.changed() => break,
			}

			if let Err(e) = self.feed_once().await {
				error!("queue tick failed: {e}");
			}
		}
		debug!("queue feeder stopped");
	}
}
