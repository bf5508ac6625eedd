use std::sync::{
	atomic::{AtomicBool, AtomicUsize, Ordering},
	Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
	sync::{mpsc, Mutex as AsyncMutex},
	task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::models::TaskId;

pub const DEFAULT_WORKERS: usize = 2;

/// What a worker does with one dequeued task id.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
	async fn handle(&self, task_id: TaskId);
}

#[derive(Debug, Error)]
pub enum PoolError {
	#[error("worker pool is shut down")]
	Closed,
}

#[derive(Debug)]
enum QueueItem {
	Job(TaskId),
	/// Sentinel: the worker that takes it exits.
	Stop,
}

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<QueueItem>>>;

/// Fixed set of long-lived workers draining one FIFO queue of task ids.
///
/// Each worker runs one job at a time and never prefetches. Must be created
/// inside a tokio runtime.
pub struct WorkerPool {
	tx: mpsc::UnboundedSender<QueueItem>,
	rx: SharedReceiver,
	handler: Arc<dyn JobHandler>,
	workers: Mutex<Vec<JoinHandle<()>>>,
	queued: Arc<AtomicUsize>,
	closed: AtomicBool,
}

impl WorkerPool {
	pub fn new(handler: Arc<dyn JobHandler>, size: usize) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		let pool = Self {
			tx,
			rx: Arc::new(AsyncMutex::new(rx)),
			handler,
			workers: Mutex::new(Vec::new()),
			queued: Arc::new(AtomicUsize::new(0)),
			closed: AtomicBool::new(false),
		};
		pool.resize(size.max(1));
		pool
	}

	/// Non-blocking enqueue.
	pub fn submit(&self, task_id: TaskId) -> Result<(), PoolError> {
		// Held across the check and the send so no job can land behind the stop sentinels.
		let _workers = self.workers.lock();
		if self.closed.load(Ordering::Acquire) {
			return Err(PoolError::Closed);
		}
		self.queued.fetch_add(1, Ordering::AcqRel);
		self.tx.send(QueueItem::Job(task_id)).map_err(|_| {
			self.queued.fetch_sub(1, Ordering::AcqRel);
			PoolError::Closed
		})
	}

	/// Grow to `size` workers. Never shrinks; running workers are kept.
	pub fn resize(&self, size: usize) {
		let mut workers = self.workers.lock();
		if self.closed.load(Ordering::Acquire) {
			return;
		}
		while workers.len() < size {
			let index = workers.len();
			workers.push(tokio::spawn(worker_loop(
				index,
				self.rx.clone(),
				self.handler.clone(),
				self.queued.clone(),
			)));
		}
		debug!(workers = workers.len(), "worker pool sized");
	}

	pub fn worker_count(&self) -> usize {
		self.workers.lock().len()
	}

	/// Jobs submitted but not yet picked up by a worker.
	pub fn queued(&self) -> usize {
		self.queued.load(Ordering::Acquire)
	}

	/// Push one stop sentinel per worker and wait for all of them. Jobs
	/// already queued ahead of the sentinels, and any in flight, finish first.
	pub async fn shutdown(&self) {
		let workers: Vec<JoinHandle<()>> = {
			let mut guard = self.workers.lock();
			self.closed.store(true, Ordering::Release);
			for _ in guard.iter() {
				// The receiver lives as long as the pool, so this cannot fail.
				let _ = self.tx.send(QueueItem::Stop);
			}
			std::mem::take(&mut *guard)
		};

		for worker in workers {
			if let Err(e) = worker.await {
				error!("worker exited abnormally: {e}");
			}
		}
		info!("worker pool stopped");
	}
}

async fn worker_loop(index: usize, rx: SharedReceiver, handler: Arc<dyn JobHandler>, queued: Arc<AtomicUsize>) {
	debug!(worker = index, "worker started");
	loop {
		// Lock only while waiting for the next item, never while working.
		let item = { rx.lock().await.recv().await };

		let task_id = match item {
			Some(QueueItem::Job(task_id)) => task_id,
			Some(QueueItem::Stop) | None => break,
		};
		queued.fetch_sub(1, Ordering::AcqRel);

		// A panicking job must not take the worker down with it.
		let handler = handler.clone();
		let job = tokio::spawn({
			let task_id = task_id.clone();
			async move { handler.handle(task_id).await }
		});
		if let Err(e) = job.await {
			error!(worker = index, %task_id, "job panicked: {e}");
		}
	}
	debug!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::sync::Barrier;

	use super::*;

	#[derive(Default)]
	struct Recorder {
		seen: Mutex<Vec<TaskId>>,
		active: AtomicUsize,
		max_active: AtomicUsize,
	}

	#[async_trait]
	impl JobHandler for Recorder {
		async fn handle(&self, task_id: TaskId) {
			let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_active.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(5)).await;
			self.seen.lock().push(task_id);
			self.active.fetch_sub(1, Ordering::SeqCst);
		}
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn single_worker_is_fifo_and_serial() {
		let recorder = Arc::new(Recorder::default());
		let pool = WorkerPool::new(recorder.clone(), 1);

		for id in ["j1", "j2", "j3"] {
			pool.submit(id.to_string()).unwrap();
		}
		pool.shutdown().await;

		assert_eq!(*recorder.seen.lock(), vec!["j1", "j2", "j3"]);
		assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn shutdown_drains_everything_queued() {
		let recorder = Arc::new(Recorder::default());
		let pool = WorkerPool::new(recorder.clone(), 3);

		for i in 0..12 {
			pool.submit(format!("job-{i}")).unwrap();
		}
		pool.shutdown().await;

		assert_eq!(recorder.seen.lock().len(), 12);
		assert_eq!(pool.queued(), 0);
		assert!(recorder.max_active.load(Ordering::SeqCst) <= 3);
	}

	#[tokio::test]
	async fn submit_after_shutdown_is_rejected() {
		let pool = WorkerPool::new(Arc::new(Recorder::default()), 1);
		pool.shutdown().await;

		assert!(matches!(pool.submit("late".into()), Err(PoolError::Closed)));
		assert_eq!(pool.worker_count(), 0);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn submits_racing_shutdown_either_run_or_are_rejected() {
		let recorder = Arc::new(Recorder::default());
		let pool = Arc::new(WorkerPool::new(recorder.clone(), 2));

		let submitter = tokio::spawn({
			let pool = pool.clone();
			async move {
				let mut accepted = 0;
				for i in 0..500 {
					if pool.submit(format!("job-{i}")).is_ok() {
						accepted += 1;
					}
					tokio::task::yield_now().await;
				}
				accepted
			}
		});
		tokio::task::yield_now().await;
		pool.shutdown().await;
		let accepted = submitter.await.unwrap();

		// Nothing accepted may be stranded behind a stop sentinel.
		assert_eq!(recorder.seen.lock().len(), accepted);
		assert_eq!(pool.queued(), 0);
	}

	#[tokio::test]
	async fn resize_after_shutdown_spawns_nothing() {
		let pool = WorkerPool::new(Arc::new(Recorder::default()), 1);
		pool.shutdown().await;
		pool.resize(4);
		assert_eq!(pool.worker_count(), 0);
	}

	struct Rendezvous(Barrier);

	#[async_trait]
	impl JobHandler for Rendezvous {
		async fn handle(&self, _task_id: TaskId) {
			self.0.wait().await;
		}
	}

	#[tokio::test]
	async fn resize_adds_workers() {
		// Three jobs that only finish once all three run at the same time.
		let pool = WorkerPool::new(Arc::new(Rendezvous(Barrier::new(3))), 1);
		pool.resize(3);
		pool.resize(2);
		assert_eq!(pool.worker_count(), 3);

		for i in 0..3 {
			pool.submit(format!("job-{i}")).unwrap();
		}
		tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
			.await
			.expect("jobs should run concurrently after resize");
	}

	struct Panicky(Mutex<Vec<TaskId>>);

	#[async_trait]
	impl JobHandler for Panicky {
		async fn handle(&self, task_id: TaskId) {
			if task_id == "boom" {
				panic!("handler blew up");
			}
			self.0.lock().push(task_id);
		}
	}

	#[tokio::test]
	async fn panicking_job_keeps_worker_alive() {
		let handler = Arc::new(Panicky(Mutex::new(Vec::new())));
		let pool = WorkerPool::new(handler.clone(), 1);

		pool.submit("boom".into()).unwrap();
		pool.submit("after".into()).unwrap();
		pool.shutdown().await;

		assert_eq!(*handler.0.lock(), vec!["after"]);
	}
}
