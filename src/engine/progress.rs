use std::sync::LazyLock;

use regex::Regex;

/// rclone's byte-stats line, e.g.
/// `Transferred:   1.500 MiB / 10 MiB, 15%, 512 KiB/s, ETA 16s`.
/// The per-file count line (`Transferred: 0 / 1, 0%`) carries no speed and
/// must not match.
static TRANSFERRED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^\s*Transferred:\s+(\S.*?)\s+/\s+(\S.*?),\s+(\d+(?:\.\d+)?)%,\s+(\S.*?)/s,\s+ETA\s+(\S+)\s*$")
		.expect("invalid progress regex")
});

/// One progress reading. Every field is the raw text rclone printed,
/// units included; nothing downstream does arithmetic on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
	pub current: String,
	pub total: String,
	pub percent: String,
	pub speed: String,
	pub eta: String,
}

pub fn parse(line: &str) -> Option<ProgressSnapshot> {
	let caps = TRANSFERRED_REGEX.captures(line)?;
	Some(ProgressSnapshot {
		current: caps[1].to_string(),
		total: caps[2].to_string(),
		percent: caps[3].to_string(),
		speed: caps[4].to_string(),
		eta: caps[5].to_string(),
	})
}
