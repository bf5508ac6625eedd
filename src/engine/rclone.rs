//! Thin wrapper around the `rclone` executable.
//!
//! Three invocations are used:
//! - `copy <local> <origin>:<remote> [flags]` for the actual transfer,
//! - `lsf <origin>:<path>` as a read-only existence probe,
//! - `config show` to list configured remotes.

use std::{
	io,
	path::{Path, PathBuf},
	process::Stdio,
	sync::LazyLock,
};

use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::models::Task;

/// Flags every copy starts with. Per-task overrides replace entries by name.
const DEFAULT_FLAGS: &[(&str, Option<&str>)] = &[
	("--progress", None),
	("--stats", Some("1s")),
	("--update", None),
	("--timeout", Some("5m")),
	("--contimeout", Some("60s")),
	("--retries", Some("3")),
	("--retries-sleep", Some("10s")),
	("--low-level-retries", Some("10")),
];

/// Flag prefixes a stored per-task flags string may use, and whether the flag takes a value.
const ALLOWED_FLAGS: &[(&str, bool)] = &[
	("--progress", false),
	("--update", false),
	("--checksum", false),
	("--size-only", false),
	("--ignore-existing", false),
	("--ignore-times", false),
	("--no-traverse", false),
	("--use-server-modtime", false),
	("--stats", true),
	("--timeout", true),
	("--contimeout", true),
	("--retries-sleep", true),
	("--retries", true),
	("--low-level-retries", true),
	("--bwlimit", true),
	("--transfers", true),
	("--checkers", true),
	("--buffer-size", true),
	("--tpslimit", true),
	("--multi-thread-streams", true),
	("--multi-thread-cutoff", true),
	("--log-level", true),
	("--drive-", true),
	("--s3-", true),
	("--onedrive-", true),
];

static REMOTE_NAME_REGEX: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"\[(.*?)\]").expect("invalid remote name regex"));

#[derive(Debug, Error)]
pub enum RcloneError {
	#[error("rclone executable not found: {0}")]
	NotInstalled(String),

	#[error("failed to start rclone: {0}")]
	Spawn(#[from] io::Error),

	#[error("rclone exited with {code:?}: {stderr}")]
	CommandFailed { code: Option<i32>, stderr: String },

	#[error("rejected rclone flags: {0}")]
	InvalidFlags(String),
}

/// How to reach rclone: the executable plus arguments placed before every
/// subcommand (e.g. `--config <file>`).
#[derive(Debug, Clone)]
pub struct Rclone {
	binary: PathBuf,
	global_args: Vec<String>,
}

/// A fully built copy invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyCommand {
	pub program: PathBuf,
	pub args: Vec<String>,
}

impl CopyCommand {
	/// Shell-quoted command line, for logs.
	pub fn display(&self) -> String {
		let program = self.program.to_string_lossy().into_owned();
		let parts: Vec<&str> = std::iter::once(program.as_str()).chain(self.args.iter().map(String::as_str)).collect();
		shlex::try_join(parts.iter().copied()).unwrap_or_else(|_| parts.join(" "))
	}

	pub fn command(&self) -> Command {
		let mut cmd = Command::new(&self.program);
		cmd.args(&self.args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		cmd
	}
}

impl Rclone {
	pub fn new(binary: impl Into<PathBuf>) -> Self {
		Self { binary: binary.into(), global_args: Vec::new() }
	}

	pub fn with_global_args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.global_args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn with_config_file(self, path: &Path) -> Self {
		let path = path.to_string_lossy().into_owned();
		self.with_global_args(["--config".to_string(), path])
	}

	pub fn binary(&self) -> &Path {
		&self.binary
	}

	pub fn copy_command(&self, task: &Task) -> Result<CopyCommand, RcloneError> {
		let mut args = self.global_args.clone();
		args.push("copy".into());
		args.push(task.local_path.clone());
		args.push(task.remote_target());
		args.extend(build_flags(task.flags.as_deref())?);

		Ok(CopyCommand { program: self.binary.clone(), args })
	}

	/// Whether `origin:path` exists on the remote. A listing error (the
	/// usual answer for a missing object) counts as absent.
	pub async fn exists(&self, remote: &str) -> Result<bool, RcloneError> {
		match self.run(&["lsf", remote]).await {
			Ok(stdout) => Ok(!stdout.trim().is_empty()),
			Err(RcloneError::CommandFailed { code, stderr }) => {
				debug!(remote, ?code, stderr = %stderr.trim(), "lsf failed, treating as absent");
				Ok(false)
			}
			Err(e) => Err(e),
		}
	}

	/// Names of the remotes configured in rclone's config file.
	pub async fn list_remotes(&self) -> Result<Vec<String>, RcloneError> {
		let stdout = self.run(&["config", "show"]).await?;
		Ok(parse_remote_names(&stdout))
	}

	async fn run(&self, args: &[&str]) -> Result<String, RcloneError> {
		let output = Command::new(&self.binary)
			.args(&self.global_args)
			.args(args)
			.stdin(Stdio::null())
			.output()
			.await
			.map_err(|e| spawn_error(e, &self.binary))?;

		if !output.status.success() {
			return Err(RcloneError::CommandFailed {
				code: output.status.code(),
				stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
			});
		}
		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}
}

/// Separate "not installed" from every other spawn failure.
pub fn spawn_error(err: io::Error, binary: &Path) -> RcloneError {
	match err.kind() {
		io::ErrorKind::NotFound => RcloneError::NotInstalled(binary.display().to_string()),
		_ => RcloneError::Spawn(err),
	}
}

pub fn parse_remote_names(config: &str) -> Vec<String> {
	REMOTE_NAME_REGEX.captures_iter(config).map(|c| c[1].to_string()).collect()
}

fn allowed(name: &str) -> Option<bool> {
	ALLOWED_FLAGS
		.iter()
		.find(|(prefix, _)| name.starts_with(prefix))
		.map(|(_, takes_value)| *takes_value)
}

/// Default flags merged with a per-task override string.
///
/// The override is tokenized shell-style; every token must be an allow-listed
/// flag or the value of one. Bare positional tokens are rejected so a stored
/// field can never add sources or destinations to the command.
pub fn build_flags(overrides: Option<&str>) -> Result<Vec<String>, RcloneError> {
	let mut flags: Vec<(String, Option<String>)> = DEFAULT_FLAGS
		.iter()
		.map(|(name, value)| (name.to_string(), value.map(str::to_string)))
		.collect();

	let overrides = overrides.map(str::trim).filter(|s| !s.is_empty());
	if let Some(raw) = overrides {
		let tokens = shlex::split(raw).ok_or_else(|| RcloneError::InvalidFlags(format!("unbalanced quoting in {raw:?}")))?;
		let mut tokens = tokens.into_iter();

		while let Some(token) = tokens.next() {
			let (name, inline_value) = match token.split_once('=') {
				Some((name, value)) => (name.to_string(), Some(value.to_string())),
				None => (token.clone(), None),
			};
			if !name.starts_with('-') {
				return Err(RcloneError::InvalidFlags(format!("unexpected argument {token:?}")));
			}
			let takes_value =
				allowed(&name).ok_or_else(|| RcloneError::InvalidFlags(format!("flag {name:?} is not allowed")))?;

			let value = match (takes_value, inline_value) {
				(true, Some(value)) => Some(value),
				(true, None) => Some(
					tokens
						.next()
						.filter(|v| !v.starts_with('-'))
						.ok_or_else(|| RcloneError::InvalidFlags(format!("flag {name:?} needs a value")))?,
				),
				(false, Some(_)) => {
					return Err(RcloneError::InvalidFlags(format!("flag {name:?} takes no value")));
				}
				(false, None) => None,
			};

			match flags.iter_mut().find(|(existing, _)| *existing == name) {
				Some(slot) => slot.1 = value,
				None => flags.push((name, value)),
			}
		}
	}

	Ok(flags
		.into_iter()
		.flat_map(|(name, value)| std::iter::once(name).chain(value))
		.collect())
}

#[cfg(test)]
pub(crate) mod testing {
	use std::{fs, path::Path};

	use super::Rclone;

	/// A stand-in rclone: a shell script run through `/bin/sh`, so the file
	/// is read rather than executed.
	pub fn fake_rclone(dir: &Path, script: &str) -> Rclone {
		let path = dir.join("fake-rclone.sh");
		fs::write(&path, script).unwrap();
		Rclone::new("/bin/sh").with_global_args([path.to_string_lossy().into_owned()])
	}
}
