//! Per-user limit state and its table.
//!
//! One entry per user seen locally, created on first admit and
//! reclaimed by a GC pass once the user has been quiescent. Filters
//! hold `Arc`s to their entry, so reclamation only detaches the entry
//! from the table; in-flight requests keep it alive.

use crate::time::MS_PER_SEC;
use freq_window::FreqWindow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use weir_model::{Direction, UserKey};

const SHARE_PERIOD_MS: u64 = MS_PER_SEC;

/// Outcome of a limit-share update.
#[derive(Debug, PartialEq, Eq)]
pub enum ShareApplied {
	Applied,
	/// Older than what we already hold; ignored.
	Stale,
}

/// One direction's worth of a user's limit state.
pub struct DirState {
	received: AtomicBool,
	received_at_us: AtomicU64,
	share: AtomicU64,
	counter: FreqWindow,
	active: AtomicI64,
	next_throttle_log_ms: AtomicU64,
}

impl DirState {
	fn new() -> Self {
		Self {
			received: AtomicBool::new(false),
			received_at_us: AtomicU64::new(0),
			share: AtomicU64::new(0),
			counter: FreqWindow::new(SHARE_PERIOD_MS),
			active: AtomicI64::new(0),
			next_throttle_log_ms: AtomicU64::new(0),
		}
	}

	/// Bytes/sec granted by the generator, if any update arrived yet.
	#[must_use]
	pub fn share(&self) -> Option<u64> {
		self.received.load(Ordering::Acquire).then(|| self.share.load(Ordering::Acquire))
	}

	#[must_use]
	pub fn active(&self) -> i64 {
		self.active.load(Ordering::Acquire)
	}

	#[must_use]
	pub const fn counter(&self) -> &FreqWindow {
		&self.counter
	}

	/// Updates are monotone per direction: an update carrying an older
	/// timestamp than the stored one is dropped regardless of delivery
	/// order.
	pub fn apply_share(&self, ts_us: u64, bytes_per_sec: u64) -> ShareApplied {
		loop {
			let stored = self.received_at_us.load(Ordering::Acquire);
			if ts_us < stored {
				return ShareApplied::Stale;
			}
			if self
				.received_at_us
				.compare_exchange_weak(stored, ts_us, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				self.share.store(bytes_per_sec, Ordering::Release);
				self.received.store(true, Ordering::Release);
				return ShareApplied::Applied;
			}
		}
	}

	/// Claim this second's throttle log slot. Exactly one caller per
	/// second wins.
	pub fn try_claim_throttle_log(&self, now_ms: u64) -> bool {
		let due = self.next_throttle_log_ms.load(Ordering::Acquire);
		if now_ms < due {
			return false;
		}
		self.next_throttle_log_ms
			.compare_exchange(due, now_ms + MS_PER_SEC, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}
}

/// Per-user limit entry.
pub struct UserLimit {
	user: UserKey,
	dirs: [DirState; 2],
	last_request_end_ms: AtomicU64,
}

impl UserLimit {
	fn new(user: UserKey) -> Self {
		Self {
			user,
			dirs: [DirState::new(), DirState::new()],
			last_request_end_ms: AtomicU64::new(0),
		}
	}

	#[must_use]
	pub const fn user(&self) -> &UserKey {
		&self.user
	}

	#[must_use]
	pub const fn dir(&self, dir: Direction) -> &DirState {
		&self.dirs[dir.index()]
	}

	pub fn incr_active(&self, dir: Direction) -> i64 {
		self.dir(dir).active.fetch_add(1, Ordering::AcqRel) + 1
	}

	/// Counts can transiently dip below zero when attach and detach
	/// race across filters; warn and keep going.
	pub fn decr_active(&self, dir: Direction) -> i64 {
		let after = self.dir(dir).active.fetch_sub(1, Ordering::AcqRel) - 1;
		if after < 0 {
			tracing::warn!(user = %self.user, dir = %dir, count = after, "active request count went negative");
		}
		after
	}

	pub fn mark_request_end(&self, now_ms: u64) {
		self.last_request_end_ms.store(now_ms, Ordering::Release);
	}

	fn reclaimable(&self, now_ms: u64, quiescence_ms: u64) -> bool {
		let last_end = self.last_request_end_ms.load(Ordering::Acquire);
		last_end > 0
			&& now_ms.saturating_sub(last_end) >= quiescence_ms
			&& self.dir(Direction::Up).active() <= 0
			&& self.dir(Direction::Dwn).active() <= 0
	}
}

/// The table of per-user entries, reader-biased: payload-path lookups
/// take the read lock, enable/ingest/GC take the write lock.
pub struct UserLimitTable {
	users: RwLock<HashMap<UserKey, Arc<UserLimit>>>,
	next_gc_ms: AtomicU64,
	cleanup_interval_ms: u64,
	quiescence_ms: u64,
}

impl UserLimitTable {
	#[must_use]
	pub fn new(cleanup_interval: Duration, quiescence: Duration) -> Self {
		Self {
			users: RwLock::new(HashMap::new()),
			next_gc_ms: AtomicU64::new(0),
			cleanup_interval_ms: u64::try_from(cleanup_interval.as_millis()).unwrap_or(u64::MAX),
			quiescence_ms: u64::try_from(quiescence.as_millis()).unwrap_or(u64::MAX),
		}
	}

	#[must_use]
	pub fn get(&self, user: &UserKey) -> Option<Arc<UserLimit>> {
		self.users.read().unwrap_or_else(PoisonError::into_inner).get(user).cloned()
	}

	pub fn get_or_insert(&self, user: &UserKey) -> Arc<UserLimit> {
		if let Some(entry) = self.get(user) {
			return entry;
		}
		let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
		Arc::clone(users.entry(user.clone()).or_insert_with(|| Arc::new(UserLimit::new(user.clone()))))
	}

	/// Sweep reclaimable entries, at most once per cleanup interval.
	/// Runs on the enable path, so the claim is a cheap CAS.
	pub fn maybe_gc(&self, now_ms: u64) {
		let due = self.next_gc_ms.load(Ordering::Acquire);
		if now_ms < due
			|| self
				.next_gc_ms
				.compare_exchange(due, now_ms + self.cleanup_interval_ms, Ordering::AcqRel, Ordering::Acquire)
				.is_err()
		{
			return;
		}
		let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
		let before = users.len();
		users.retain(|_, entry| !entry.reclaimable(now_ms, self.quiescence_ms));
		let swept = before - users.len();
		if swept > 0 {
			tracing::debug!(swept, remaining = users.len(), "reclaimed quiescent user limit entries");
		}
	}

	/// Apply one instance-local share from a `limit_share` record.
	/// Users with no local entry are skipped; they will pick up a fresh
	/// share on the tick after their first request.
	pub fn apply_limit_share(&self, user: &UserKey, dir: Direction, ts_us: u64, bytes_per_sec: u64, minimum_limit: u64) {
		let Some(entry) = self.get(user) else {
			return;
		};
		let clamped = if bytes_per_sec > u64::from(u32::MAX) {
			tracing::warn!(user = %user, bytes_per_sec, "limit share exceeds u32 range, clamping");
			u64::from(u32::MAX)
		} else {
			bytes_per_sec
		};
		let share = clamped.max(minimum_limit);
		if entry.dir(dir).apply_share(ts_us, share) == ShareApplied::Stale {
			tracing::debug!(user = %user, dir = %dir, ts_us, "dropping stale limit share update");
		}
	}

	/// Users with a positive active count in at least one direction.
	#[must_use]
	pub fn snapshot_active(&self) -> Vec<(Arc<UserLimit>, [i64; 2])> {
		self.users
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.values()
			.filter_map(|entry| {
				let counts = [entry.dir(Direction::Up).active(), entry.dir(Direction::Dwn).active()];
				(counts[0] > 0 || counts[1] > 0).then(|| (Arc::clone(entry), counts))
			})
			.collect()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.users.read().unwrap_or_else(PoisonError::into_inner).len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
