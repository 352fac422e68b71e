use std::net::SocketAddr;
use std::time::Duration;
use weir_model::InstanceId;

/// Filter options. The proxy wires these from its own listener config;
/// the named options (`active-requests-refresh-interval`,
/// `unknown-user-limit`, `minimum-limit`) are the operator-facing knobs.
#[derive(Clone, Debug)]
pub struct EnforcerConfig {
	/// Deployment identifier; suffixes every aggregated KV key.
	pub endpoint: String,
	/// This edge process (`<host>-<port>`).
	pub instance: InstanceId,
	/// Local collector's UDP ingress.
	pub collector_addr: SocketAddr,
	/// Policy generator's TCP listener.
	pub policy_addr: SocketAddr,
	/// Cadence of `active_reqs` refresh events.
	pub active_requests_refresh_interval: Duration,
	/// Bytes/sec applied to users with no received limit share.
	pub unknown_user_limit: u64,
	/// Floor applied to every received limit share.
	pub minimum_limit: u64,
	/// Minimum spacing between per-user-table GC sweeps.
	pub cleanup_interval: Duration,
	/// A user entry must be idle this long past its last request end
	/// before GC may reclaim it.
	pub quiescence: Duration,
	/// Upper bound of the uniform jitter sleep during policy slowdown.
	pub jitter_range_ms: u64,
	/// Seconds over which a policy slowdown decays (doubling allowance
	/// per elapsed second).
	pub backoff_window_secs: u64,
}

impl EnforcerConfig {
	#[must_use]
	pub fn new(endpoint: &str, instance: InstanceId, collector_addr: SocketAddr, policy_addr: SocketAddr) -> Self {
		Self {
			endpoint: endpoint.to_string(),
			instance,
			collector_addr,
			policy_addr,
			active_requests_refresh_interval: Duration::from_secs(10),
			unknown_user_limit: 100 * 1024 * 1024,
			minimum_limit: 64 * 1024,
			cleanup_interval: Duration::from_secs(30),
			quiescence: Duration::from_secs(5),
			jitter_range_ms: 2,
			backoff_window_secs: 6,
		}
	}
}
