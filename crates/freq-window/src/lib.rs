//! Sliding-window frequency counter.
//!
//! Tracks an event rate over two consecutive periods and estimates the
//! rate over the sliding window that spans them: the previous period's
//! count is weighted by how much of it still overlaps the window. This
//! avoids the fixed-window edge case where two adjacent windows can
//! collectively pass twice the configured rate around the boundary.
//!
//! The structure is lock-free: rotation into a new period is elected with
//! a single compare-and-swap on the period start, and counts are plain
//! atomic adds. Concurrent callers may attribute a handful of events to
//! the neighboring period during rotation; the estimate tolerates that.
//!
//! All methods take the caller's clock (`now_ms`) so the enforcer's tick
//! drives every counter consistently and tests stay deterministic.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct FreqWindow {
	period_ms: u64,
	/// Start of the current period, in ms, aligned to `period_ms`.
	period_start: AtomicU64,
	curr: AtomicU64,
	prev: AtomicU64,
}

impl FreqWindow {
	/// `period_ms` must be nonzero; it is the length of one accounting
	/// period, and the effective sliding window is twice that.
	#[must_use]
	pub fn new(period_ms: u64) -> Self {
		assert!(period_ms > 0, "period must be nonzero");
		Self {
			period_ms,
			period_start: AtomicU64::new(0),
			curr: AtomicU64::new(0),
			prev: AtomicU64::new(0),
		}
	}

	#[must_use]
	pub const fn period_ms(&self) -> u64 {
		self.period_ms
	}

	/// Count `n` events at `now_ms`.
	pub fn record(&self, n: u64, now_ms: u64) {
		self.rotate(now_ms);
		self.curr.fetch_add(n, Ordering::AcqRel);
	}

	/// Estimated event count over the sliding window ending at `now_ms`.
	#[must_use]
	pub fn estimate(&self, now_ms: u64) -> u64 {
		self.rotate(now_ms);
		let start = self.period_start.load(Ordering::Acquire);
		let elapsed = now_ms.saturating_sub(start).min(self.period_ms);
		let prev = self.prev.load(Ordering::Acquire);
		let curr = self.curr.load(Ordering::Acquire);
		let carried = (u128::from(prev) * u128::from(self.period_ms - elapsed) / u128::from(self.period_ms)) as u64;
		curr.saturating_add(carried)
	}

	/// How far the window's usage exceeds `limit`, or 0.
	#[must_use]
	pub fn overshoot(&self, limit: u64, now_ms: u64) -> u64 {
		self.estimate(now_ms).saturating_sub(limit)
	}

	/// How much of `limit` is still unused in the window, or 0.
	#[must_use]
	pub fn remaining(&self, limit: u64, now_ms: u64) -> u64 {
		limit.saturating_sub(self.estimate(now_ms))
	}

	/// Milliseconds until the window estimate decays below `limit`.
	///
	/// Returns 0 when there is room right now. When the current period
	/// alone holds `limit` or more, no amount of decay helps before the
	/// next rotation, so the delay runs to the period boundary.
	#[must_use]
	pub fn next_event_delay(&self, limit: u64, now_ms: u64) -> u64 {
		self.rotate(now_ms);
		let start = self.period_start.load(Ordering::Acquire);
		let elapsed = now_ms.saturating_sub(start).min(self.period_ms);
		let prev = self.prev.load(Ordering::Acquire);
		let curr = self.curr.load(Ordering::Acquire);

		let carried = (u128::from(prev) * u128::from(self.period_ms - elapsed) / u128::from(self.period_ms)) as u64;
		if curr.saturating_add(carried) < limit {
			return 0;
		}
		if curr >= limit || prev == 0 {
			return self.period_ms - elapsed;
		}
		// Solve curr + prev * (period - e) / period < limit for the
		// smallest elapsed offset e, then subtract what already passed.
		let excess = curr.saturating_add(prev).saturating_sub(limit).saturating_add(1);
		let e = (u128::from(self.period_ms) * u128::from(excess)).div_ceil(u128::from(prev)) as u64;
		e.min(self.period_ms).saturating_sub(elapsed)
	}

	fn rotate(&self, now_ms: u64) {
		loop {
			let start = self.period_start.load(Ordering::Acquire);
			if now_ms < start.saturating_add(self.period_ms) {
				return;
			}
			let periods_behind = (now_ms - start) / self.period_ms;
			let new_start = start + periods_behind * self.period_ms;
			if self
				.period_start
				.compare_exchange_weak(start, new_start, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				let old = self.curr.swap(0, Ordering::AcqRel);
				// Counts only carry over across exactly one period gap;
				// a longer idle stretch empties the whole window.
				self.prev.store(if periods_behind == 1 && start > 0 { old } else { 0 }, Ordering::Release);
				return;
			}
		}
	}
}
