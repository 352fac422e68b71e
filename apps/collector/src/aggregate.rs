//! In-memory aggregation between flushes.
//!
//! Request counts key on `(user, second, category)` where the second is
//! the floor of the wall clock at arrival: two events landing 200 ms
//! apart inside one second must merge, two events straddling a second
//! boundary must not. Byte counts accumulate per `(user, direction)`;
//! active-request samples overwrite per compound key.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::Instant;
use weir_model::keys;
use weir_model::{Direction, UserKey};
use weir_proto::EdgeEvent;

/// Aggregation key for one user's count of one category (verb or
/// operation class) in one wall-clock second.
#[derive(Debug, Clone)]
pub struct CmdKey {
	user: UserKey,
	stamp_ms: u64,
	category: String,
}

impl CmdKey {
	#[must_use]
	pub fn new(user: UserKey, category: String, stamp_ms: u64) -> Self {
		Self { user, stamp_ms, category }
	}

	#[must_use]
	pub const fn sec(&self) -> u64 {
		self.stamp_ms / 1_000
	}
}

// Equality and hash deliberately ignore the sub-second remainder.
impl PartialEq for CmdKey {
	fn eq(&self, other: &Self) -> bool {
		self.user == other.user && self.sec() == other.sec() && self.category == other.category
	}
}

impl Eq for CmdKey {}

impl Hash for CmdKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.user.hash(state);
		self.sec().hash(state);
		self.category.hash(state);
	}
}

pub struct Aggregates {
	commands: HashMap<CmdKey, u64>,
	bytes: HashMap<(UserKey, Direction), u64>,
	active: HashMap<String, u64>,
	pending_updates: usize,
	last_flush: Instant,
}

impl Aggregates {
	#[must_use]
	pub fn new() -> Self {
		Self {
			commands: HashMap::new(),
			bytes: HashMap::new(),
			active: HashMap::new(),
			pending_updates: 0,
			last_flush: Instant::now(),
		}
	}

	/// Fold one parsed event in, stamped with arrival time.
	pub fn apply(&mut self, event: EdgeEvent, now_ms: u64, endpoint: &str) {
		match event {
			EdgeEvent::Req { user, verb, op_class, .. } => {
				*self.commands.entry(CmdKey::new(user.clone(), verb, now_ms)).or_insert(0) += 1;
				if let Some(class) = op_class {
					*self.commands.entry(CmdKey::new(user, class, now_ms)).or_insert(0) += 1;
				}
				self.pending_updates += 1;
			}
			EdgeEvent::ReqEnd { instance, user, dir, active, .. } => {
				// The trailing count in req_end is applied like a
				// sample, but nothing assumes it is monotone.
				self.active.insert(keys::conn_key(dir, &instance, &user, endpoint), active);
				self.pending_updates += 1;
			}
			EdgeEvent::DataXfer { user, dir, length, .. } => {
				*self.bytes.entry((user, dir)).or_insert(0) += length;
				self.pending_updates += 1;
			}
			EdgeEvent::ActiveReqs { instance, user, dir, active } => {
				self.active.insert(keys::conn_key(dir, &instance, &user, endpoint), active);
				self.pending_updates += 1;
			}
			EdgeEvent::Throttle { ts_usec, dir, user } => {
				tracing::debug!(user = %user, dir = %dir, ts_usec, "edge reported throttling");
			}
		}
	}

	#[must_use]
	pub fn flush_due(&self, batch_count: usize, batch_period_ms: u64) -> bool {
		self.pending_updates >= batch_count || (self.pending_updates > 0 && self.last_flush.elapsed().as_millis() >= u128::from(batch_period_ms))
	}

	#[must_use]
	pub const fn pending(&self) -> usize {
		self.pending_updates
	}

	/// Drain everything into one redis pipeline. Counter keys get one
	/// EXPIRE per distinct key per flush; active counts are plain SETs
	/// with the longer TTL.
	pub fn drain_into_pipeline(&mut self, endpoint: &str, qos_ttl: i64, conn_ttl: u64) -> (redis::Pipeline, usize) {
		let mut pipe = redis::pipe();
		let mut expired: HashSet<String> = HashSet::new();
		let mut updates = 0_usize;

		for (key, count) in self.commands.drain() {
			let redis_key = keys::verb_key(key.sec(), &key.user, endpoint);
			pipe.hincr(&redis_key, &key.category, count).ignore();
			if expired.insert(redis_key.clone()) {
				pipe.expire(&redis_key, qos_ttl).ignore();
			}
			updates += 1;
		}
		for ((user, dir), count) in self.bytes.drain() {
			let redis_key = keys::user_bnd_key(&user, endpoint);
			pipe.hincr(&redis_key, keys::bnd_field(dir), count).ignore();
			if expired.insert(redis_key.clone()) {
				pipe.expire(&redis_key, qos_ttl).ignore();
			}
			updates += 1;
		}
		for (key, count) in self.active.drain() {
			pipe.set_ex(&key, count, conn_ttl).ignore();
			updates += 1;
		}

		self.pending_updates = 0;
		self.last_flush = Instant::now();
		(pipe, updates)
	}

	/// While the store is unreachable: counter entries old enough that
	/// their TTL would already have expired them are dropped, and
	/// active-request state is dropped entirely (the edge refreshes it).
	pub fn discard_stale(&mut self, qos_ttl_secs: u64, now_ms: u64) {
		let cutoff_sec = (now_ms / 1_000).saturating_sub(qos_ttl_secs);
		let before = self.commands.len();
		self.commands.retain(|key, _| key.sec() >= cutoff_sec);
		let dropped = before - self.commands.len() + self.active.len();
		self.active.clear();
		if dropped > 0 {
			tracing::warn!(dropped, "discarded aggregates while disconnected from redis");
		}
	}
}

impl Default for Aggregates {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use weir_model::InstanceId;

	fn user(key: &str) -> UserKey {
		UserKey::from_wire(key).unwrap()
	}

	fn req(key: &str, verb: &str, op_class: Option<&str>) -> EdgeEvent {
		EdgeEvent::Req {
			peer: "10.0.0.1:1".to_string(),
			user: user(key),
			verb: verb.to_string(),
			dir: Direction::Dwn,
			instance: InstanceId::new("edge-a", 8080),
			active: 1,
			op_class: op_class.map(str::to_string),
		}
	}

	#[test]
	fn test_cmd_key_ignores_subsecond_jitter() {
		let a = CmdKey::new(user("common"), "GET".to_string(), 5_000_100);
		let b = CmdKey::new(user("common"), "GET".to_string(), 5_000_900);
		assert_eq!(a, b);

		let mut map = HashMap::new();
		map.insert(a, 1_u64);
		assert!(map.contains_key(&b));
	}

	#[test]
	fn test_cmd_key_distinguishes_seconds_and_categories() {
		let base = CmdKey::new(user("common"), "GET".to_string(), 5_000_900);
		assert_ne!(base, CmdKey::new(user("common"), "GET".to_string(), 5_001_000));
		assert_ne!(base, CmdKey::new(user("common"), "PUT".to_string(), 5_000_900));
		assert_ne!(base, CmdKey::new(user("OTHERUSER"), "GET".to_string(), 5_000_900));
	}

	#[test]
	fn test_req_counts_merge_within_a_second() {
		let mut agg = Aggregates::new();
		agg.apply(req("common", "GET", None), 5_000_100, "ep");
		agg.apply(req("common", "GET", None), 5_000_800, "ep");
		agg.apply(req("common", "GET", None), 5_001_200, "ep");
		assert_eq!(agg.commands.len(), 2);
		assert_eq!(agg.pending(), 3);
	}

	#[test]
	fn test_op_class_counts_alongside_verb() {
		let mut agg = Aggregates::new();
		agg.apply(req("common", "GET", Some("LISTBUCKETS")), 5_000_000, "ep");
		let verb_count = agg.commands.get(&CmdKey::new(user("common"), "GET".to_string(), 5_000_000));
		let class_count = agg.commands.get(&CmdKey::new(user("common"), "LISTBUCKETS".to_string(), 5_000_000));
		assert_eq!(verb_count, Some(&1));
		assert_eq!(class_count, Some(&1));
	}

	#[test]
	fn test_active_samples_overwrite() {
		let mut agg = Aggregates::new();
		let sample = |active| EdgeEvent::ActiveReqs {
			instance: InstanceId::new("edge-a", 8080),
			user: user("common"),
			dir: Direction::Up,
			active,
		};
		agg.apply(sample(3), 5_000_000, "ep");
		agg.apply(sample(1), 5_000_500, "ep");
		assert_eq!(agg.active.len(), 1);
		assert_eq!(agg.active.values().next(), Some(&1));
	}

	#[test]
	fn test_drain_produces_one_expire_per_key() {
		let mut agg = Aggregates::new();
		agg.apply(req("common", "GET", None), 5_000_100, "ep");
		agg.apply(req("common", "PUT", None), 5_000_200, "ep");
		agg.apply(
			EdgeEvent::DataXfer {
				peer: "10.0.0.1:1".to_string(),
				user: user("common"),
				dir: Direction::Dwn,
				length: 4_096,
			},
			5_000_300,
			"ep",
		);

		let (pipe, updates) = agg.drain_into_pipeline("ep", 5, 60);
		assert_eq!(updates, 3);
		// Two HINCRBYs on the same verb key share one EXPIRE; the byte
		// key gets its own pair.
		assert_eq!(pipe.cmd_iter().count(), 5);
		assert_eq!(agg.pending(), 0);
	}

	#[test]
	fn test_discard_stale_keeps_fresh_counts() {
		let mut agg = Aggregates::new();
		agg.apply(req("common", "GET", None), 5_000_000, "ep");
		agg.apply(req("common", "GET", None), 12_000_000, "ep");
		agg.apply(
			EdgeEvent::ActiveReqs {
				instance: InstanceId::new("edge-a", 8080),
				user: user("common"),
				dir: Direction::Up,
				active: 1,
			},
			12_000_000,
			"ep",
		);

		agg.discard_stale(5, 12_000_000);
		assert_eq!(agg.commands.len(), 1);
		assert!(agg.active.is_empty());
	}
}
