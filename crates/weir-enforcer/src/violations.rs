//! Locally-held violation state fed by the policy channel.
//!
//! Three tables:
//! - rate violations: `"user_<VERB>" → second → users`, entries rejected
//!   for the second they name and discarded a few seconds later,
//! - reqs-block: an active flag per user with a short grace window, so
//!   a silent generator lets blocks expire instead of wedging users,
//! - throttle state per direction, driving the shaper's policy-slowdown
//!   mode.

use crate::time::US_PER_SEC;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::{PoisonError, RwLock};
use weir_model::{Direction, UserKey};
use weir_proto::Policy;

/// Rate-map entries older than this many seconds are purged on touch.
const RATE_RETENTION_SECS: u64 = 3;

/// An unrefreshed reqs-block expires after this many seconds.
const BLOCK_GRACE_SECS: u64 = 2;

/// Snapshot of one user's policy-slowdown state in one direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThrottleState {
	/// When the violation was stamped by the generator.
	pub received_epoch_us: u64,
	/// Microsecond offset within the stamped second.
	pub elapsed_us_in_epoch: u64,
	/// observed/granted at the generator; > 1 means running ahead.
	pub diff_ratio: f64,
	/// Ratio from the previous update, for the jitter condition.
	pub prev_diff_ratio: f64,
}

impl ThrottleState {
	#[must_use]
	pub const fn received_epoch_sec(&self) -> u64 {
		self.received_epoch_us / US_PER_SEC
	}
}

pub struct ViolationTables {
	rate: RwLock<BTreeMap<String, BTreeMap<u64, HashSet<UserKey>>>>,
	reqs_block: DashMap<UserKey, u64>,
	throttle: [DashMap<UserKey, ThrottleState>; 2],
}

impl ViolationTables {
	#[must_use]
	pub fn new() -> Self {
		Self {
			rate: RwLock::new(BTreeMap::new()),
			reqs_block: DashMap::new(),
			throttle: [DashMap::new(), DashMap::new()],
		}
	}

	/// Route one policy into the tables. `LimitShare` is not handled
	/// here; the caller applies it to the user limit table.
	pub fn ingest(&self, policy: &Policy, now_sec: u64) {
		match policy {
			Policy::RateViolation { ts_usec, verb, users } => {
				self.ingest_rate(*ts_usec, verb, users, now_sec);
			}
			Policy::BandwidthViolation { ts_usec, dir, entries } => {
				for (user, ratio) in entries {
					self.set_throttle(user, *dir, *ts_usec, ratio.unwrap_or(1.0));
				}
			}
			Policy::ReqsBlock { users } => {
				for user in users {
					self.reqs_block.insert(user.clone(), now_sec);
				}
			}
			Policy::ReqsUnblock { users } => {
				for user in users {
					self.reqs_block.remove(user);
				}
			}
			Policy::LimitShare { .. } => {}
		}
	}

	fn ingest_rate(&self, ts_usec: u64, verb: &str, users: &[UserKey], now_sec: u64) {
		let sec = ts_usec / US_PER_SEC;
		if sec < now_sec {
			tracing::debug!(verb, sec, now_sec, "dropping rate violation for a past second");
			return;
		}
		let mut rate = self.rate.write().unwrap_or_else(PoisonError::into_inner);
		let buckets = rate.entry(format!("user_{verb}")).or_default();
		buckets.retain(|s, _| s + RATE_RETENTION_SECS >= now_sec);
		buckets.entry(sec).or_default().extend(users.iter().cloned());
	}

	/// Is `user` named in a rate violation for `key` in this second?
	/// `key` is the map key form (`user_GET`, `user_LISTBUCKETS`, ...).
	#[must_use]
	pub fn rate_violated(&self, key: &str, user: &UserKey, now_sec: u64) -> bool {
		let rate = self.rate.read().unwrap_or_else(PoisonError::into_inner);
		rate.get(key).and_then(|buckets| buckets.get(&now_sec)).is_some_and(|users| users.contains(user))
	}

	/// Is `user` blocked for excessive concurrency? Expires by itself
	/// once the generator stops refreshing it.
	#[must_use]
	pub fn reqs_blocked(&self, user: &UserKey, now_sec: u64) -> bool {
		match self.reqs_block.get(user) {
			Some(stamp) => *stamp + BLOCK_GRACE_SECS > now_sec,
			None => false,
		}
	}

	pub fn set_throttle(&self, user: &UserKey, dir: Direction, ts_usec: u64, diff_ratio: f64) {
		let table = &self.throttle[dir.index()];
		let prev = table.get(user).map_or(diff_ratio, |s| s.diff_ratio);
		table.insert(
			user.clone(),
			ThrottleState {
				received_epoch_us: ts_usec,
				elapsed_us_in_epoch: ts_usec % US_PER_SEC,
				diff_ratio,
				prev_diff_ratio: prev,
			},
		);
	}

	#[must_use]
	pub fn throttle_state(&self, user: &UserKey, dir: Direction) -> Option<ThrottleState> {
		self.throttle[dir.index()].get(user).map(|s| *s)
	}

	/// Like [`Self::throttle_state`], but drops entries whose back-off
	/// window has fully elapsed so the tables track only live slowdowns.
	pub fn touch_throttle(&self, user: &UserKey, dir: Direction, now_us: u64, backoff_window_secs: u64) -> Option<ThrottleState> {
		let state = self.throttle_state(user, dir)?;
		if (now_us / US_PER_SEC).saturating_sub(state.received_epoch_sec()) >= backoff_window_secs {
			self.throttle[dir.index()].remove(user);
			return None;
		}
		Some(state)
	}
}

impl Default for ViolationTables {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(key: &str) -> UserKey {
		UserKey::from_wire(key).unwrap()
	}

	fn rate_policy(ts_usec: u64, verb: &str, keys: &[&str]) -> Policy {
		Policy::RateViolation {
			ts_usec,
			verb: verb.to_string(),
			users: keys.iter().map(|k| user(k)).collect(),
		}
	}

	#[test]
	fn test_rate_violation_hits_its_second_only() {
		let t = ViolationTables::new();
		let now = 1_000;
		t.ingest(&rate_policy(1_000 * US_PER_SEC + 250_000, "GET", &["common"]), now);

		assert!(t.rate_violated("user_GET", &user("common"), 1_000));
		assert!(!t.rate_violated("user_GET", &user("common"), 1_001));
		assert!(!t.rate_violated("user_PUT", &user("common"), 1_000));
		assert!(!t.rate_violated("user_GET", &user("OTHERUSER"), 1_000));
	}

	#[test]
	fn test_stale_rate_violation_is_dropped() {
		let t = ViolationTables::new();
		t.ingest(&rate_policy(999 * US_PER_SEC, "GET", &["common"]), 1_000);
		assert!(!t.rate_violated("user_GET", &user("common"), 1_000));
	}

	#[test]
	fn test_old_rate_buckets_purge_on_touch() {
		let t = ViolationTables::new();
		t.ingest(&rate_policy(1_000 * US_PER_SEC, "GET", &["common"]), 1_000);
		// A later ingest for the same verb purges seconds beyond retention.
		t.ingest(&rate_policy(1_010 * US_PER_SEC, "GET", &["OTHERUSER"]), 1_010);
		let rate = t.rate.read().unwrap();
		assert!(!rate.get("user_GET").unwrap().contains_key(&1_000));
	}

	#[test]
	fn test_reqs_block_expires_after_grace() {
		let t = ViolationTables::new();
		t.ingest(&Policy::ReqsBlock { users: vec![user("common")] }, 500);
		assert!(t.reqs_blocked(&user("common"), 500));
		assert!(t.reqs_blocked(&user("common"), 501));
		assert!(!t.reqs_blocked(&user("common"), 502));
	}

	#[test]
	fn test_block_then_unblock_within_grace() {
		let t = ViolationTables::new();
		t.ingest(&Policy::ReqsBlock { users: vec![user("common")] }, 500);
		t.ingest(&Policy::ReqsUnblock { users: vec![user("common")] }, 500);
		assert!(!t.reqs_blocked(&user("common"), 500));
	}

	#[test]
	fn test_throttle_state_preserves_previous_ratio() {
		let t = ViolationTables::new();
		let u = user("common");
		t.set_throttle(&u, Direction::Dwn, 5 * US_PER_SEC, 2.0);
		t.set_throttle(&u, Direction::Dwn, 6 * US_PER_SEC, 1.2);

		let state = t.throttle_state(&u, Direction::Dwn).unwrap();
		assert_eq!(state.diff_ratio, 1.2);
		assert_eq!(state.prev_diff_ratio, 2.0);
		assert_eq!(state.received_epoch_sec(), 6);
		assert!(t.throttle_state(&u, Direction::Up).is_none());
	}

	#[test]
	fn test_bandwidth_violation_defaults_missing_ratio() {
		let t = ViolationTables::new();
		t.ingest(
			&Policy::BandwidthViolation {
				ts_usec: 7 * US_PER_SEC,
				dir: Direction::Up,
				entries: vec![(user("common"), None)],
			},
			7,
		);
		let state = t.throttle_state(&user("common"), Direction::Up).unwrap();
		assert_eq!(state.diff_ratio, 1.0);
	}
}
