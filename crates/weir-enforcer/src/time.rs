//! Wall-clock ticks. Everything in the enforcer keys off the unix
//! epoch so edge tables and KV keys agree on second boundaries.

use std::time::{SystemTime, UNIX_EPOCH};

#[must_use]
pub fn epoch_us() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
		.unwrap_or_default()
}

#[must_use]
pub fn epoch_ms() -> u64 {
	epoch_us() / 1_000
}

#[must_use]
pub fn epoch_sec() -> u64 {
	epoch_us() / 1_000_000
}

pub const US_PER_SEC: u64 = 1_000_000;
pub const MS_PER_SEC: u64 = 1_000;
