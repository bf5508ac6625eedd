use std::{path::Path, process::ExitCode, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cloudsync::{
	config::{CliArgs, Command, Settings},
	db,
	engine::{executor::TransferExecutor, poller::Supervisor, pool::WorkerPool, rclone::Rclone, scanner::Scanner},
	logging,
	models::{Folder, FolderStatus, TaskStatus},
	store::{JobStore, MemoryStore},
};

fn main() -> ExitCode {
	let args = CliArgs::parse();

	let _guard = match logging::init(args.log_dir.as_deref()) {
		Ok(guard) => guard,
		Err(e) => {
			eprintln!("Error: failed to set up logging: {e}");
			return ExitCode::from(2);
		}
	};

	match run(args) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!("{e:#}");
			ExitCode::FAILURE
		}
	}
}

fn run(args: CliArgs) -> Result<()> {
	let settings = Settings::from_args(&args)?;

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("failed to create tokio runtime")?;

	runtime.block_on(async move {
		let store = open_store(&settings).await?;
		let rclone = settings.rclone();

		match args.command {
			Command::Run { .. } => serve(store, rclone, &settings).await,
			Command::AddFolder { local_path, origin, remote_path, name, max_depth } => {
				add_folder(store.as_ref(), &local_path, origin, remote_path, name, max_depth).await
			}
			Command::ScanNow => scan_now(store, rclone, &settings).await,
			Command::FeedNow { .. } => feed_now(store, rclone, &settings).await,
			Command::Status => status(store.as_ref()).await,
			Command::Remotes => {
				for remote in rclone.list_remotes().await? {
					println!("{remote}");
				}
				Ok(())
			}
		}
	})
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn JobStore>> {
	match &settings.db_path {
		Some(path) => {
			let store = db::open(path)
				.await
				.with_context(|| format!("failed to open database at {}", path.display()))?;
			info!(path = %path.display(), "database opened");
			Ok(Arc::new(store))
		}
		None => {
			warn!("running with an in-memory store; nothing will be persisted");
			Ok(Arc::new(MemoryStore::new()))
		}
	}
}

fn supervisor(store: Arc<dyn JobStore>, rclone: Rclone, settings: &Settings) -> Arc<Supervisor> {
	let executor = Arc::new(TransferExecutor::new(store.clone(), rclone.clone()));
	let pool = Arc::new(WorkerPool::new(executor, settings.workers));
	let scanner = Scanner::new(store.clone(), rclone);
	Arc::new(Supervisor::new(store, scanner, pool, settings.delay))
}

async fn serve(store: Arc<dyn JobStore>, rclone: Rclone, settings: &Settings) -> Result<()> {
	info!(
		workers = settings.workers,
		delay_secs = settings.delay.as_secs(),
		rclone = %rclone.binary().display(),
		"starting"
	);
	let supervisor = supervisor(store, rclone, settings);

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => info!("interrupt received, finishing in-flight transfers"),
			Err(e) => error!("failed to listen for ctrl-c: {e}"),
		}
		let _ = shutdown_tx.send(true);
	});

	supervisor.run(shutdown_rx).await;
	info!("stopped");
	Ok(())
}

async fn add_folder(
	store: &dyn JobStore,
	local_path: &Path,
	origin: String,
	remote_path: String,
	name: Option<String>,
	max_depth: usize,
) -> Result<()> {
	let local_path = local_path
		.canonicalize()
		.with_context(|| format!("cannot resolve {}", local_path.display()))?;
	if !local_path.is_dir() {
		bail!("{} is not a directory", local_path.display());
	}
	let name = name
		.or_else(|| local_path.file_name().map(|n| n.to_string_lossy().into_owned()))
		.unwrap_or_else(|| local_path.display().to_string());

	let folder = Folder::new(name, local_path.to_string_lossy(), remote_path, origin).with_max_depth(max_depth);
	store.insert_folder(&folder).await?;

	info!(folder = %folder.name, "folder registered");
	println!("{}\t{} -> {}:{}", folder.id, folder.local_path, folder.origin, folder.remote_path);
	Ok(())
}

async fn scan_now(store: Arc<dyn JobStore>, rclone: Rclone, settings: &Settings) -> Result<()> {
	let supervisor = supervisor(store, rclone, settings);
	supervisor.recover().await?;

	let mut scanned = 0;
	for target in [FolderStatus::Unscanned, FolderStatus::Watching] {
		scanned += supervisor.scan_once(target).await?;
	}
	supervisor.pool().shutdown().await;

	println!("scanned {scanned} folders");
	Ok(())
}

async fn feed_now(store: Arc<dyn JobStore>, rclone: Rclone, settings: &Settings) -> Result<()> {
	let supervisor = supervisor(store.clone(), rclone, settings);
	supervisor.recover().await?;

	let queued = supervisor.feed_once().await?;
	supervisor.pool().shutdown().await;

	let succeeded = store.count_tasks(Some(TaskStatus::Succeeded)).await?;
	let failed = store.count_tasks(Some(TaskStatus::Failed)).await?;
	println!("ran {queued} tasks ({succeeded} succeeded, {failed} failed overall)");
	Ok(())
}

async fn status(store: &dyn JobStore) -> Result<()> {
	println!("folders: {}", store.count_folders().await?);
	for status in TaskStatus::ALL {
		println!("{:>10}: {}", status.label(), store.count_tasks(Some(status)).await?);
	}
	println!("{:>10}: {}", "total", store.count_tasks(None).await?);

	let logs = store.recent_logs(10).await?;
	if !logs.is_empty() {
		println!();
		for entry in logs {
			println!("{}  {}: {}", entry.created_at.format("%Y-%m-%d %H:%M:%S"), entry.name, entry.description);
		}
	}
	Ok(())
}
