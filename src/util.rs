use chrono::TimeDelta;

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Human-readable size in base-1024 units: `10B`, `1.5KB`, `3.0GB`.
pub fn format_size(bytes: u64) -> String {
	let mut size = bytes as f64;
	let mut unit = 0;
	while size >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
		size /= 1024.0;
		unit += 1;
	}

	if unit == 0 {
		format!("{bytes}B")
	} else {
		format!("{size:.1}{}", SIZE_UNITS[unit])
	}
}

/// `HH:MM:SS`; hours keep counting past a day.
pub fn format_duration(elapsed: TimeDelta) -> String {
	let secs = elapsed.num_seconds().max(0);
	format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
