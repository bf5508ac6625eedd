use std::{fs, io, path::Path};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "cloudsync=info,warn";

pub const LOG_FILE: &str = "cloudsync.log";

/// Install the global subscriber: stderr always, plus `<log_dir>/cloudsync.log`
/// when a directory is given. `RUST_LOG` overrides the default filter.
///
/// Keep the returned guard alive until exit or buffered file lines are lost.
pub fn init(log_dir: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
	let stderr = fmt::layer().with_writer(io::stderr).with_target(false);

	match log_dir {
		Some(dir) => {
			fs::create_dir_all(dir)?;
			let appender = tracing_appender::rolling::never(dir, LOG_FILE);
			let (writer, guard) = tracing_appender::non_blocking(appender);
			tracing_subscriber::registry()
				.with(filter)
				.with(stderr)
				.with(fmt::layer().with_writer(writer).with_ansi(false))
				.init();
			Ok(Some(guard))
		}
		None => {
			tracing_subscriber::registry().with(filter).with(stderr).init();
			Ok(None)
		}
	}
}
