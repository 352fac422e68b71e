//! The process-wide enforcer handle.
//!
//! One `EdgeQos` per proxy process: `init` builds the tables and
//! spawns the background tasks, `shutdown` cancels and joins them.
//! Per-request state lives on the [`RequestGuard`], never here; admin
//! queries all route through the handle.

use crate::admission::{self, Admission, RequestMeta};
use crate::config::EnforcerConfig;
use crate::emitter::EventEmitter;
use crate::error::EnforcerError;
use crate::policy_client;
use crate::user_limits::UserLimitTable;
use crate::violations::ViolationTables;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weir_model::{Direction, UserKey};
use weir_proto::EdgeEvent;

pub(crate) struct EdgeInner {
	pub(crate) cfg: EnforcerConfig,
	pub(crate) table: UserLimitTable,
	pub(crate) violations: ViolationTables,
	pub(crate) emitter: EventEmitter,
	/// Remote endpoint → user key, maintained while requests are live
	/// so payload handling can be attributed by socket address.
	pub(crate) peers: DashMap<SocketAddr, UserKey>,
}

pub struct EdgeQos {
	inner: Arc<EdgeInner>,
	cancel: CancellationToken,
	tasks: Vec<JoinHandle<()>>,
}

impl EdgeQos {
	/// Build the enforcer and spawn its background tasks (policy
	/// channel client, `active_reqs` refresher). Must run inside a
	/// tokio runtime.
	///
	/// # Errors
	/// Fails when the event socket cannot be created.
	pub fn init(cfg: EnforcerConfig) -> Result<Self, EnforcerError> {
		let emitter = EventEmitter::new(cfg.collector_addr)?;
		let inner = Arc::new(EdgeInner {
			table: UserLimitTable::new(cfg.cleanup_interval, cfg.quiescence),
			violations: ViolationTables::new(),
			emitter,
			peers: DashMap::new(),
			cfg,
		});
		let cancel = CancellationToken::new();
		let tasks = vec![
			tokio::spawn(policy_client::run(Arc::clone(&inner), cancel.clone())),
			tokio::spawn(refresher(Arc::clone(&inner), cancel.clone())),
		];
		Ok(Self { inner, cancel, tasks })
	}

	/// Admit or reject one request.
	#[must_use]
	pub fn admit(&self, meta: &RequestMeta<'_>) -> Admission {
		admission::admit(&self.inner, meta)
	}

	/// Users with in-flight requests, with per-direction counts.
	#[must_use]
	pub fn active_users(&self) -> Vec<(UserKey, [i64; 2])> {
		self.inner
			.table
			.snapshot_active()
			.into_iter()
			.map(|(entry, counts)| (entry.user().clone(), counts))
			.collect()
	}

	/// Number of user limit entries currently tracked.
	#[must_use]
	pub fn tracked_users(&self) -> usize {
		self.inner.table.len()
	}

	/// The user's current granted share, if any update arrived.
	#[must_use]
	pub fn share_for(&self, user: &UserKey, dir: Direction) -> Option<u64> {
		self.inner.table.get(user).and_then(|entry| entry.dir(dir).share())
	}

	/// The user attributed to a live remote endpoint.
	#[must_use]
	pub fn user_for_peer(&self, peer: &SocketAddr) -> Option<UserKey> {
		self.inner.peers.get(peer).map(|u| u.value().clone())
	}

	/// Cancel background tasks and wait for them.
	pub async fn shutdown(mut self) {
		self.cancel.cancel();
		for task in self.tasks.drain(..) {
			if let Err(err) = task.await {
				tracing::warn!(%err, "enforcer task ended abnormally");
			}
		}
	}
}

/// Re-emit `active_reqs` for every busy user so the KV store's
/// concurrency counters stay fresh and instances that crash age out.
async fn refresher(inner: Arc<EdgeInner>, cancel: CancellationToken) {
	let mut ticker = tokio::time::interval(inner.cfg.active_requests_refresh_interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			() = cancel.cancelled() => return,
			_ = ticker.tick() => {}
		}
		for (entry, counts) in inner.table.snapshot_active() {
			for dir in Direction::ALL {
				let count = counts[dir.index()];
				if count > 0 {
					inner.emitter.emit(&EdgeEvent::ActiveReqs {
						instance: inner.cfg.instance.clone(),
						user: entry.user().clone(),
						dir,
						active: u64::try_from(count).unwrap_or(0),
					});
				}
			}
		}
	}
}
