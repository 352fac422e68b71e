//! Per-request admission and the request guard.
//!
//! The guard is the filter's per-request state: it pins the user's
//! limit entry for the request's lifetime and runs the detach path on
//! every exit (drop), so counters and `req_end` events never leak.

use crate::edge::EdgeInner;
use crate::shaper::{fair_share, slowdown_gate, Gate, Shape};
use crate::time::{epoch_ms, epoch_sec, epoch_us, MS_PER_SEC};
use crate::user_limits::UserLimit;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use weir_model::{Direction, UserKey};
use weir_proto::EdgeEvent;

/// Matched before any QoS rule; never limited, never counted.
pub const HEALTHCHECK_PATH: &str = "/healthcheck";

/// What the proxy hands us per request.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
	pub method: &'a str,
	pub path: &'a str,
	pub query: Option<&'a str>,
	pub authorization: Option<&'a str>,
	/// Remote socket address. Absent disables bandwidth shaping for
	/// this request; everything else still applies.
	pub peer: Option<SocketAddr>,
}

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
	/// Concurrent-request block is active for this user.
	Requests,
	/// The user is named in a rate violation for this second.
	Rate { key: String },
}

impl Violation {
	#[must_use]
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::Requests => "requests",
			Self::Rate { .. } => "rate",
		}
	}
}

pub enum Admission {
	Granted(RequestGuard),
	Rejected(Violation),
}

/// Per-request filter state. Dropping it runs the detach path.
pub struct RequestGuard {
	/// `None` for pass-through requests (healthcheck).
	pub(crate) inner: Option<Arc<EdgeInner>>,
	pub(crate) entry: Option<Arc<UserLimit>>,
	pub(crate) user: UserKey,
	pub(crate) verb: String,
	pub(crate) dir: Direction,
	pub(crate) peer: Option<SocketAddr>,
}

impl RequestGuard {
	pub(crate) fn passthrough() -> Self {
		Self {
			inner: None,
			entry: None,
			user: UserKey::anonymous(),
			verb: String::new(),
			dir: Direction::Dwn,
			peer: None,
		}
	}

	#[must_use]
	pub const fn user(&self) -> &UserKey {
		&self.user
	}

	#[must_use]
	pub const fn direction(&self) -> Direction {
		self.dir
	}

	#[must_use]
	pub const fn is_enforced(&self) -> bool {
		self.inner.is_some()
	}

	/// Shape one payload chunk. Called for every chunk the proxy wants
	/// to forward in this request's direction.
	#[must_use]
	pub fn shape(&self, requested: usize) -> Shape {
		let (Some(inner), Some(entry)) = (&self.inner, &self.entry) else {
			return Shape::Transmit {
				bytes: requested,
				next_delay: None,
			};
		};
		if self.peer.is_none() {
			return Shape::Transmit {
				bytes: requested,
				next_delay: None,
			};
		}

		let now_us = epoch_us();
		let state = inner.violations.touch_throttle(&self.user, self.dir, now_us, inner.cfg.backoff_window_secs);
		match slowdown_gate(state.as_ref(), now_us, inner.cfg.backoff_window_secs) {
			Gate::Throttled => {
				let dir_state = entry.dir(self.dir);
				if dir_state.try_claim_throttle_log(now_us / MS_PER_SEC) {
					tracing::info!(user = %self.user, dir = %self.dir, "throttling user under bandwidth policy");
					inner.emitter.emit(&EdgeEvent::Throttle {
						ts_usec: now_us,
						dir: self.dir,
						user: self.user.clone(),
					});
				}
				return Shape::Throttle {
					retry_after: Duration::from_millis(1),
				};
			}
			Gate::Proceed { jitter: true } => {
				// Deliberate back-pressure: spread contending streams
				// within the allowed run window.
				let range_us = inner.cfg.jitter_range_ms.max(1) * 1_000;
				let pause = rand::thread_rng().gen_range(0..range_us);
				std::thread::sleep(Duration::from_micros(pause));
			}
			Gate::Proceed { jitter: false } => {}
		}

		let dir_state = entry.dir(self.dir);
		let share = dir_state.share().unwrap_or(inner.cfg.unknown_user_limit);
		if share == u64::MAX {
			return Shape::Transmit {
				bytes: requested,
				next_delay: None,
			};
		}
		let shape = fair_share(dir_state.counter(), share, dir_state.active(), requested, epoch_ms());
		if let Shape::Transmit { bytes, .. } = &shape {
			if *bytes > 0 {
				inner.emitter.emit(&EdgeEvent::DataXfer {
					peer: peer_label(self.peer),
					user: self.user.clone(),
					dir: self.dir,
					length: *bytes as u64,
				});
			}
		}
		shape
	}
}

impl Drop for RequestGuard {
	fn drop(&mut self) {
		let (Some(inner), Some(entry)) = (&self.inner, &self.entry) else {
			return;
		};
		let after = entry.decr_active(self.dir);
		entry.mark_request_end(epoch_ms());
		if let Some(peer) = self.peer {
			inner.peers.remove(&peer);
		}
		inner.emitter.emit(&EdgeEvent::ReqEnd {
			peer: peer_label(self.peer),
			user: self.user.clone(),
			verb: self.verb.clone(),
			dir: self.dir,
			instance: inner.cfg.instance.clone(),
			active: u64::try_from(after.max(0)).unwrap_or(0),
		});
	}
}

pub(crate) fn peer_label(peer: Option<SocketAddr>) -> String {
	peer.map_or_else(|| "0.0.0.0:0".to_string(), |p| p.to_string())
}

/// Request direction by verb: reads shape the response stream,
/// everything else shapes the request stream.
#[must_use]
pub fn direction_for(method: &str) -> Direction {
	match method {
		"GET" | "HEAD" | "OPTIONS" => Direction::Dwn,
		_ => Direction::Up,
	}
}

pub(crate) fn admit(inner: &Arc<EdgeInner>, meta: &RequestMeta<'_>) -> Admission {
	if meta.path == HEALTHCHECK_PATH {
		return Admission::Granted(RequestGuard::passthrough());
	}

	let user = weir_model::user_key::extract_user_key(meta.authorization, meta.query);
	let op_class = weir_model::op_class::classify(meta.method, meta.path, meta.query);
	let now_sec = epoch_sec();

	if inner.violations.reqs_blocked(&user, now_sec) {
		return Admission::Rejected(Violation::Requests);
	}
	let verb_key = format!("user_{}", meta.method);
	if inner.violations.rate_violated(&verb_key, &user, now_sec) {
		return Admission::Rejected(Violation::Rate { key: verb_key });
	}
	if let Some(class) = op_class {
		let class_key = format!("user_{class}");
		if inner.violations.rate_violated(&class_key, &user, now_sec) {
			return Admission::Rejected(Violation::Rate { key: class_key });
		}
	}

	let dir = direction_for(meta.method);
	inner.table.maybe_gc(epoch_ms());
	let entry = inner.table.get_or_insert(&user);
	let active = entry.incr_active(dir);
	if let Some(peer) = meta.peer {
		inner.peers.insert(peer, user.clone());
	}
	inner.emitter.emit(&EdgeEvent::Req {
		peer: peer_label(meta.peer),
		user: user.clone(),
		verb: meta.method.to_string(),
		dir,
		instance: inner.cfg.instance.clone(),
		active: u64::try_from(active.max(0)).unwrap_or(0),
		op_class: op_class.map(|c| c.as_str().to_string()),
	});

	Admission::Granted(RequestGuard {
		inner: Some(Arc::clone(inner)),
		entry: Some(entry),
		user,
		verb: meta.method.to_string(),
		dir,
		peer: meta.peer,
	})
}
