use crate::error::PolygenError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Policy generator configuration from the YAML file given as the
/// first process argument. The limits table itself lives in a separate
/// JSON file derived from `zone`, reloadable at runtime via the FIFO.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolygenConfig {
	/// Policy channel listener port; every edge connects here.
	pub port: u16,
	pub redis_server: String,
	/// Deployment identifier; must match the collectors'.
	pub endpoint: String,
	/// Names the limits file and the reload FIFO.
	pub zone: String,
	pub tick_msec: u64,
	/// Unblock once usage drops this far (percent) below the limit.
	pub hysteresis_pct: u64,
	/// Floor on computed per-instance shares.
	pub minimum_limit: u64,
	pub log_level: String,
}

impl Default for PolygenConfig {
	fn default() -> Self {
		Self {
			port: 8515,
			redis_server: "127.0.0.1:6379".to_string(),
			endpoint: "default".to_string(),
			zone: "default".to_string(),
			tick_msec: 1_000,
			hysteresis_pct: 10,
			minimum_limit: 64 * 1024,
			log_level: "info".to_string(),
		}
	}
}

impl PolygenConfig {
	/// # Errors
	/// Missing file or invalid YAML, with the usual exit-code mapping.
	pub fn load(path: &Path) -> Result<Self, PolygenError> {
		let raw = std::fs::read_to_string(path).map_err(|err| {
			if err.kind() == std::io::ErrorKind::NotFound {
				PolygenError::ConfigMissing(path.to_path_buf())
			} else {
				PolygenError::Io(err)
			}
		})?;
		Ok(serde_yaml::from_str(&raw)?)
	}

	/// # Errors
	/// `BadRedisServer` when `redis_server` is not `host:port`.
	pub fn redis_url(&self) -> Result<String, PolygenError> {
		let (host, port) = self
			.redis_server
			.rsplit_once(':')
			.ok_or_else(|| PolygenError::BadRedisServer(self.redis_server.clone()))?;
		if host.is_empty() || port.parse::<u16>().is_err() {
			return Err(PolygenError::BadRedisServer(self.redis_server.clone()));
		}
		Ok(format!("redis://{}/", self.redis_server))
	}

	/// `~/weir_<zone>_cache_limits.json`
	#[must_use]
	pub fn limits_path(&self) -> PathBuf {
		let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
		home.join(format!("weir_{}_cache_limits.json", self.zone))
	}

	/// `/tmp/weir_<zone>_polygen_reload.fifo`
	#[must_use]
	pub fn reload_fifo_path(&self) -> PathBuf {
		PathBuf::from(format!("/tmp/weir_{}_polygen_reload.fifo", self.zone))
	}
}
