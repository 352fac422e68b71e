//! Per-chunk bandwidth shaping.
//!
//! Two stages run for every payload chunk of an enforced request:
//!
//! 1. The policy-slowdown gate. While a bandwidth violation from the
//!    generator is fresh, the user only gets the head of each wall
//!    second: an allowed run window that starts at zero and doubles
//!    per elapsed second until the back-off window has passed.
//! 2. Fair share. The user's per-direction frequency counter is held
//!    to the granted share, and whatever quota remains in the window
//!    is split evenly across the user's local concurrent requests.

use crate::time::US_PER_SEC;
use crate::violations::ThrottleState;
use freq_window::FreqWindow;
use std::time::Duration;

/// Floor of the allowed run window during a policy slowdown.
const MIN_RUN_WINDOW_US: u64 = 50_000;

/// Shaper verdict for one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Shape {
	/// Forward `bytes` now. When less than the full chunk was granted,
	/// `next_delay` says when to offer the remainder.
	Transmit { bytes: usize, next_delay: Option<Duration> },
	/// Nothing may move yet; re-offer the chunk after the delay.
	Wait(Duration),
	/// Policy-driven slowdown refused the chunk; retry next tick.
	Throttle { retry_after: Duration },
}

/// Outcome of the policy-slowdown gate.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Gate {
	Proceed { jitter: bool },
	Throttled,
}

/// Decide whether a policy slowdown lets this chunk through at all.
///
/// The allowed run time within the current wall second is
/// `max(50 ms, elapsed_in_epoch / diff_ratio) * 2^(age - 1)` clamped to
/// one second, where `age` is whole seconds since the violation was
/// stamped. Age zero allows nothing; past the back-off window the gate
/// is wide open.
pub(crate) fn slowdown_gate(state: Option<&ThrottleState>, now_us: u64, backoff_window_secs: u64) -> Gate {
	let Some(state) = state else {
		return Gate::Proceed { jitter: false };
	};
	let age = (now_us / US_PER_SEC).saturating_sub(state.received_epoch_sec());
	if age >= backoff_window_secs {
		return Gate::Proceed { jitter: false };
	}
	let allowed_us = if age == 0 {
		0
	} else {
		let ratio = state.diff_ratio.max(0.001);
		let base = (state.elapsed_us_in_epoch as f64 / ratio).max(MIN_RUN_WINDOW_US as f64);
		let scaled = base * f64::from(1_u32 << (age - 1).min(31));
		scaled.min(US_PER_SEC as f64) as u64
	};
	let elapsed_now = now_us % US_PER_SEC;
	if elapsed_now <= allowed_us {
		let jitter = state.diff_ratio.max(state.prev_diff_ratio) >= 1.5 || state.diff_ratio > state.prev_diff_ratio;
		Gate::Proceed { jitter }
	} else {
		Gate::Throttled
	}
}

/// Split the share-limited quota across `active` local requests and
/// grant what this chunk may take.
pub(crate) fn fair_share(counter: &FreqWindow, share: u64, active: i64, requested: usize, now_ms: u64) -> Shape {
	if requested == 0 {
		return Shape::Transmit { bytes: 0, next_delay: None };
	}
	let period = counter.period_ms();
	let max_wait = 2 * period;
	let requests = u64::try_from(active.max(1)).unwrap_or(1);

	let overshoot = counter.overshoot(share, now_ms);
	if overshoot > 0 {
		let wait_ms = if share == 0 {
			max_wait
		} else {
			let scaled = u128::from(overshoot) * u128::from(period) * u128::from(requests) / u128::from(share);
			u64::try_from(scaled).unwrap_or(max_wait).min(max_wait)
		};
		return Shape::Wait(Duration::from_millis(wait_ms.max(1)));
	}

	let quota = counter.remaining(share, now_ms).div_ceil(requests);
	if quota == 0 {
		let wait_ms = counter.next_event_delay(share, now_ms).clamp(1, max_wait);
		return Shape::Wait(Duration::from_millis(wait_ms));
	}

	let granted = quota.min(requested as u64);
	counter.record(granted, now_ms);
	let next_delay = if granted < requested as u64 {
		let delay_ms = counter.next_event_delay(share, now_ms).clamp(1, max_wait);
		Some(Duration::from_millis(delay_ms))
	} else {
		None
	};
	Shape::Transmit {
		bytes: usize::try_from(granted).unwrap_or(requested),
		next_delay,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn throttle(received_epoch_us: u64, diff_ratio: f64, prev: f64) -> ThrottleState {
		ThrottleState {
			received_epoch_us,
			elapsed_us_in_epoch: received_epoch_us % US_PER_SEC,
			diff_ratio,
			prev_diff_ratio: prev,
		}
	}

	#[test]
	fn test_no_throttle_state_is_wide_open() {
		assert_eq!(slowdown_gate(None, 5 * US_PER_SEC, 6), Gate::Proceed { jitter: false });
	}

	#[test]
	fn test_age_zero_allows_nothing_past_second_start() {
		let state = throttle(100 * US_PER_SEC + 200_000, 2.0, 2.0);
		// Same second, a bit later: elapsed 300 ms > allowed 0.
		assert_eq!(slowdown_gate(Some(&state), 100 * US_PER_SEC + 300_000, 6), Gate::Throttled);
		// Exactly at the second boundary elapsed is 0, which is allowed.
		assert!(matches!(slowdown_gate(Some(&state), 100 * US_PER_SEC, 6), Gate::Proceed { .. }));
	}

	#[test]
	fn test_allowed_window_doubles_per_second_of_age() {
		// Stamped at 400 ms into second 100 with ratio 2.0: base window
		// is max(50 ms, 400/2.0 = 200 ms) = 200 ms.
		let state = throttle(100 * US_PER_SEC + 400_000, 2.0, 2.0);

		// Age 1: allowed 200 ms.
		assert!(matches!(slowdown_gate(Some(&state), 101 * US_PER_SEC + 150_000, 6), Gate::Proceed { .. }));
		assert_eq!(slowdown_gate(Some(&state), 101 * US_PER_SEC + 250_000, 6), Gate::Throttled);

		// Age 2: allowed 400 ms.
		assert!(matches!(slowdown_gate(Some(&state), 102 * US_PER_SEC + 350_000, 6), Gate::Proceed { .. }));
		assert_eq!(slowdown_gate(Some(&state), 102 * US_PER_SEC + 450_000, 6), Gate::Throttled);

		// Age 3: allowed 800 ms.
		assert!(matches!(slowdown_gate(Some(&state), 103 * US_PER_SEC + 700_000, 6), Gate::Proceed { .. }));
	}

	#[test]
	fn test_past_backoff_window_has_no_effect() {
		let state = throttle(100 * US_PER_SEC + 900_000, 10.0, 10.0);
		assert_eq!(slowdown_gate(Some(&state), 106 * US_PER_SEC + 999_000, 6), Gate::Proceed { jitter: false });
	}

	#[test]
	fn test_minimum_run_window_applies() {
		// Stamped right at a second boundary: elapsed/ratio is 0, the
		// 50 ms floor still opens the head of each second at age >= 1.
		let state = throttle(100 * US_PER_SEC, 4.0, 4.0);
		assert!(matches!(slowdown_gate(Some(&state), 101 * US_PER_SEC + 40_000, 6), Gate::Proceed { .. }));
		assert_eq!(slowdown_gate(Some(&state), 101 * US_PER_SEC + 60_000, 6), Gate::Throttled);
	}

	#[test]
	fn test_jitter_on_high_or_rising_ratio() {
		let high = throttle(100 * US_PER_SEC, 1.6, 1.0);
		assert_eq!(slowdown_gate(Some(&high), 101 * US_PER_SEC, 6), Gate::Proceed { jitter: true });

		let rising = throttle(100 * US_PER_SEC, 1.2, 1.0);
		assert_eq!(slowdown_gate(Some(&rising), 101 * US_PER_SEC, 6), Gate::Proceed { jitter: true });

		let falling = throttle(100 * US_PER_SEC, 1.0, 1.2);
		assert_eq!(slowdown_gate(Some(&falling), 101 * US_PER_SEC, 6), Gate::Proceed { jitter: false });
	}

	#[test]
	fn test_fair_share_grants_full_chunk_under_limit() {
		let counter = FreqWindow::new(1_000);
		let shape = fair_share(&counter, 10_000, 1, 4_096, 5_000);
		assert_eq!(
			shape,
			Shape::Transmit {
				bytes: 4_096,
				next_delay: None
			}
		);
		assert_eq!(counter.estimate(5_000), 4_096);
	}

	#[test]
	fn test_fair_share_splits_across_concurrent_requests() {
		let counter = FreqWindow::new(1_000);
		// 10 KB/s, 4 concurrent requests: each gets 2.5 KB of quota.
		let shape = fair_share(&counter, 10_000, 4, 8_192, 5_000);
		match shape {
			Shape::Transmit { bytes, next_delay } => {
				assert_eq!(bytes, 2_500);
				assert!(next_delay.is_some());
			}
			other => panic!("wrong shape: {other:?}"),
		}
	}

	#[test]
	fn test_fair_share_waits_on_overshoot() {
		let counter = FreqWindow::new(1_000);
		counter.record(15_000, 5_000);
		let shape = fair_share(&counter, 10_000, 1, 1_024, 5_100);
		match shape {
			Shape::Wait(delay) => {
				// overshoot 5000 * 1000 ms * 1 / 10000 = 500 ms
				assert_eq!(delay, Duration::from_millis(500));
			}
			other => panic!("wrong shape: {other:?}"),
		}
	}

	#[test]
	fn test_overshoot_wait_is_clamped() {
		let counter = FreqWindow::new(1_000);
		counter.record(1_000_000, 5_000);
		let shape = fair_share(&counter, 10_000, 8, 1_024, 5_100);
		assert_eq!(shape, Shape::Wait(Duration::from_millis(2_000)));
	}

	#[test]
	fn test_zero_limit_waits_maximally_without_dividing() {
		let counter = FreqWindow::new(1_000);
		counter.record(100, 5_000);
		let shape = fair_share(&counter, 0, 1, 1_024, 5_100);
		assert_eq!(shape, Shape::Wait(Duration::from_millis(2_000)));
	}

	#[test]
	fn test_exactly_at_limit_waits_for_decay() {
		let counter = FreqWindow::new(1_000);
		counter.record(10_000, 5_000);
		let shape = fair_share(&counter, 10_000, 1, 1_024, 5_200);
		assert!(matches!(shape, Shape::Wait(_)));
	}

	#[test]
	fn test_zero_requested_is_a_noop() {
		let counter = FreqWindow::new(1_000);
		let shape = fair_share(&counter, 10, 1, 0, 5_000);
		assert_eq!(shape, Shape::Transmit { bytes: 0, next_delay: None });
		assert_eq!(counter.estimate(5_000), 0);
	}
}
