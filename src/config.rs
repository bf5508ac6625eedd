//! Command-line and environment configuration.
//!
//! `CliArgs` is what clap parses; `Settings` is the validated runtime form
//! handed to the engine.

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::engine::{pool::DEFAULT_WORKERS, rclone::Rclone};

/// Upper bound on concurrent rclone processes.
const MAX_WORKERS: usize = 64;

/// Default poll interval: ten minutes.
const DEFAULT_DELAY_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("invalid worker count {count}: must be between 1 and {max}")]
	InvalidWorkerCount { count: usize, max: usize },

	#[error("invalid delay {0}s: must be at least one second")]
	InvalidDelay(u64),

	#[error("no data directory available; pass --db-path")]
	NoDataDir,
}

/// Scan local folders into per-file upload jobs and run them through rclone
#[derive(Parser, Debug, Clone)]
#[command(name = "cloudsync", version, about)]
pub struct CliArgs {
	#[command(subcommand)]
	pub command: Command,

	/// Database file (SurrealKV)
	#[arg(long, env = "CLOUDSYNC_DB", value_name = "FILE", global = true)]
	pub db_path: Option<PathBuf>,

	/// Keep everything in memory; nothing survives the process
	#[arg(long, global = true)]
	pub memory: bool,

	/// rclone executable
	#[arg(long = "rclone", env = "RCLONE_BIN", default_value = "rclone", value_name = "PATH", global = true)]
	pub rclone_bin: PathBuf,

	/// rclone config file passed through as `--config`
	#[arg(long, env = "RCLONE_CONFIG", value_name = "FILE", global = true)]
	pub rclone_config: Option<PathBuf>,

	/// Also write logs to <DIR>/cloudsync.log
	#[arg(long, env = "CLOUDSYNC_LOG_DIR", value_name = "DIR", global = true)]
	pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
	/// Run the folder scanner, queue feeder and worker pool until interrupted
	Run {
		/// Seconds between poll ticks
		#[arg(long, env = "DELAY", default_value_t = DEFAULT_DELAY_SECS, value_name = "SECS")]
		delay: u64,

		/// Concurrent transfers
		#[arg(short = 'w', long, env = "WORKERS", default_value_t = DEFAULT_WORKERS, value_name = "NUM")]
		workers: usize,
	},

	/// Register a local folder to sync
	AddFolder {
		/// Local directory
		local_path: PathBuf,

		/// Remote name as configured in rclone (e.g. gdrive)
		origin: String,

		/// Destination path on the remote
		remote_path: String,

		/// Display name (defaults to the directory name)
		#[arg(long)]
		name: Option<String>,

		/// Maximum directory depth to descend
		#[arg(long, default_value_t = crate::models::folder::DEFAULT_MAX_DEPTH)]
		max_depth: usize,
	},

	/// Scan all registered folders once and exit
	ScanNow,

	/// Run every pending task once and exit
	FeedNow {
		/// Concurrent transfers
		#[arg(short = 'w', long, env = "WORKERS", default_value_t = DEFAULT_WORKERS, value_name = "NUM")]
		workers: usize,
	},

	/// Print folder and task counts
	Status,

	/// List remotes configured in rclone
	Remotes,
}

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
	pub db_path: Option<PathBuf>,
	pub rclone_bin: PathBuf,
	pub rclone_config: Option<PathBuf>,
	pub delay: Duration,
	pub workers: usize,
}

impl Settings {
	pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
		let (delay, workers) = match &args.command {
			Command::Run { delay, workers } => (*delay, *workers),
			Command::FeedNow { workers } => (DEFAULT_DELAY_SECS, *workers),
			_ => (DEFAULT_DELAY_SECS, DEFAULT_WORKERS),
		};
		if delay == 0 {
			return Err(ConfigError::InvalidDelay(delay));
		}
		if workers == 0 || workers > MAX_WORKERS {
			return Err(ConfigError::InvalidWorkerCount { count: workers, max: MAX_WORKERS });
		}

		let db_path = if args.memory {
			None
		} else {
			match &args.db_path {
				Some(path) => Some(path.clone()),
				None => Some(default_db_path().ok_or(ConfigError::NoDataDir)?),
			}
		};

		Ok(Self {
			db_path,
			rclone_bin: args.rclone_bin.clone(),
			rclone_config: args.rclone_config.clone(),
			delay: Duration::from_secs(delay),
			workers,
		})
	}

	pub fn rclone(&self) -> Rclone {
		let rclone = Rclone::new(&self.rclone_bin);
		match &self.rclone_config {
			Some(path) => rclone.with_config_file(path),
			None => rclone,
		}
	}
}

/// `<data dir>/cloudsync/cloudsync.db`
fn default_db_path() -> Option<PathBuf> {
	dirs::data_dir().map(|dir| dir.join("cloudsync").join("cloudsync.db"))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(args: &[&str]) -> CliArgs {
		CliArgs::try_parse_from(std::iter::once("cloudsync").chain(args.iter().copied())).unwrap()
	}

	#[test]
	fn run_settings() {
		let args = parse(&["run", "--delay", "30", "-w", "4", "--db-path", "/tmp/c.db"]);
		let settings = Settings::from_args(&args).unwrap();

		assert_eq!(settings.delay, Duration::from_secs(30));
		assert_eq!(settings.workers, 4);
		assert_eq!(settings.db_path, Some(PathBuf::from("/tmp/c.db")));
	}

	#[test]
	fn memory_mode_has_no_db_path() {
		let settings = Settings::from_args(&parse(&["status", "--memory"])).unwrap();
		assert!(settings.db_path.is_none());
	}

	#[test]
	fn rejects_bad_worker_counts() {
		for count in ["0", "65"] {
			let args = parse(&["run", "-w", count, "--memory"]);
			assert!(matches!(Settings::from_args(&args), Err(ConfigError::InvalidWorkerCount { .. })));
		}
	}

	#[test]
	fn rejects_zero_delay() {
		let args = parse(&["run", "--delay", "0", "--memory"]);
		assert!(matches!(Settings::from_args(&args), Err(ConfigError::InvalidDelay(0))));
	}

	#[test]
	fn add_folder_defaults() {
		let args = parse(&["add-folder", "/data/a", "gdrive", "r/a"]);
		match args.command {
			Command::AddFolder { max_depth, name, .. } => {
				assert_eq!(max_depth, 10);
				assert!(name.is_none());
			}
			other => panic!("unexpected command {other:?}"),
		}
	}
}
