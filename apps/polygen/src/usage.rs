//! Per-tick usage snapshot read back from the KV store.
//!
//! Verb and byte counters are already cross-instance aggregates (the
//! collectors increment shared keys); concurrency counters are
//! per-instance and summed here.

use crate::error::PolygenError;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use weir_model::keys;
use weir_model::{Direction, InstanceId, UserKey};

#[derive(Debug, Default)]
pub struct UsageSnapshot {
	/// `(user, second, category)` → request count across the fleet.
	pub verb_counts: HashMap<(UserKey, u64, String), u64>,
	/// Per-user, per-instance, per-direction active request counts.
	pub active: HashMap<UserKey, HashMap<(InstanceId, Direction), u64>>,
	/// `(user, direction)` → observed bytes across the fleet.
	pub bytes: HashMap<(UserKey, Direction), u64>,
}

impl UsageSnapshot {
	/// Sum of one user's active requests over all instances and both
	/// directions.
	#[must_use]
	pub fn total_active(&self, user: &UserKey) -> u64 {
		self.active.get(user).map_or(0, |per| per.values().sum())
	}

	/// Sum of one user's active requests in one direction.
	#[must_use]
	pub fn active_in_dir(&self, user: &UserKey, dir: Direction) -> u64 {
		self.active
			.get(user)
			.map_or(0, |per| per.iter().filter(|((_, d), _)| *d == dir).map(|(_, count)| count).sum())
	}
}

/// # Errors
/// Any redis error; the caller skips the tick and retries next time.
pub async fn scan(conn: &mut MultiplexedConnection, endpoint: &str) -> Result<UsageSnapshot, PolygenError> {
	let mut snapshot = UsageSnapshot::default();

	let verb_keys = collect_keys(conn, &keys::verb_scan_pattern(endpoint)).await?;
	for key in verb_keys {
		let Some(parsed) = keys::parse_verb_key(&key) else {
			continue;
		};
		let Some(user) = UserKey::from_wire(parsed.user) else {
			continue;
		};
		let sec = parsed.sec;
		let fields: HashMap<String, u64> = conn.hgetall(&key).await?;
		for (category, count) in fields {
			*snapshot.verb_counts.entry((user.clone(), sec, category)).or_insert(0) += count;
		}
	}

	let conn_keys = collect_keys(conn, &keys::conn_scan_pattern(endpoint)).await?;
	for key in conn_keys {
		let Some(parsed) = keys::parse_conn_key(&key) else {
			continue;
		};
		let Some(user) = UserKey::from_wire(parsed.user) else {
			continue;
		};
		let instance = InstanceId::from(parsed.instance);
		let count: Option<u64> = conn.get(&key).await?;
		if let Some(count) = count {
			snapshot.active.entry(user).or_default().insert((instance, parsed.dir), count);
		}
	}

	let bnd_keys = collect_keys(conn, &format!("user_*${endpoint}")).await?;
	for key in bnd_keys {
		let Some(user) = parse_bnd_key(&key, endpoint) else {
			continue;
		};
		let fields: HashMap<String, u64> = conn.hgetall(&key).await?;
		for (field, count) in fields {
			let dir = match field.as_str() {
				keys::BND_UP_FIELD => Direction::Up,
				keys::BND_DWN_FIELD => Direction::Dwn,
				_ => continue,
			};
			*snapshot.bytes.entry((user.clone(), dir)).or_insert(0) += count;
		}
	}

	Ok(snapshot)
}

async fn collect_keys(conn: &mut MultiplexedConnection, pattern: &str) -> Result<Vec<String>, PolygenError> {
	let mut iter = conn.scan_match::<&str, String>(pattern).await?;
	let mut out = Vec::new();
	while let Some(key) = iter.next_item().await {
		out.push(key);
	}
	Ok(out)
}

fn parse_bnd_key(key: &str, endpoint: &str) -> Option<UserKey> {
	let body = key.strip_prefix("user_")?;
	let (user, ep) = body.split_once('$')?;
	if ep != endpoint {
		return None;
	}
	UserKey::from_wire(user)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(key: &str) -> UserKey {
		UserKey::from_wire(key).unwrap()
	}

	#[test]
	fn test_parse_bnd_key() {
		assert_eq!(parse_bnd_key("user_common$ep", "ep"), Some(user("common")));
		assert_eq!(parse_bnd_key("user_common$other", "ep"), None);
		assert_eq!(parse_bnd_key("verb_1_user_common$ep", "ep"), None);
	}

	#[test]
	fn test_active_sums() {
		let mut snapshot = UsageSnapshot::default();
		let mut per = HashMap::new();
		per.insert((InstanceId::new("edge-a", 1), Direction::Up), 3_u64);
		per.insert((InstanceId::new("edge-a", 1), Direction::Dwn), 2);
		per.insert((InstanceId::new("edge-b", 1), Direction::Dwn), 5);
		snapshot.active.insert(user("common"), per);

		assert_eq!(snapshot.total_active(&user("common")), 10);
		assert_eq!(snapshot.active_in_dir(&user("common"), Direction::Dwn), 7);
		assert_eq!(snapshot.total_active(&user("OTHERUSER")), 0);
	}
}
