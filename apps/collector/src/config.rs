use crate::error::CollectorError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Collector daemon configuration, loaded from the YAML file given as
/// the first process argument.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
	/// UDP ingress port the edge emits to.
	pub port: u16,
	/// Number of workers, each with its own port-reused socket, queue
	/// and redis connection.
	pub num_of_syslog_servers: usize,
	/// Bound of each worker's event FIFO.
	pub msg_queue_size: usize,
	/// Flush to redis after this many pending updates...
	pub metrics_batch_count: usize,
	/// ...or this much elapsed time, whichever comes first.
	pub metrics_batch_period_msec: u64,
	/// `host:port` of the shared KV store.
	pub redis_server: String,
	/// TTL (seconds) on request/byte counter keys.
	pub redis_qos_ttl: u64,
	/// TTL (seconds) on concurrency counter keys.
	pub redis_qos_conn_ttl: u64,
	/// How often the resolved redis IP is re-checked.
	pub redis_check_conn_interval_sec: u64,
	/// Deployment identifier suffixed onto every aggregated key.
	pub endpoint: String,
	pub log_file_name: String,
	pub access_log_file_name: String,
	pub log_level: String,
}

impl Default for CollectorConfig {
	fn default() -> Self {
		Self {
			port: 8514,
			num_of_syslog_servers: 1,
			msg_queue_size: 100_000,
			metrics_batch_count: 250_000,
			metrics_batch_period_msec: 31,
			redis_server: "127.0.0.1:6379".to_string(),
			redis_qos_ttl: 5,
			redis_qos_conn_ttl: 60,
			redis_check_conn_interval_sec: 5,
			endpoint: "default".to_string(),
			log_file_name: String::new(),
			access_log_file_name: String::new(),
			log_level: "info".to_string(),
		}
	}
}

impl CollectorConfig {
	/// # Errors
	/// `ConfigMissing` when the file is absent, `ConfigInvalid` when it
	/// does not parse as YAML.
	pub fn load(path: &Path) -> Result<Self, CollectorError> {
		let raw = std::fs::read_to_string(path).map_err(|err| {
			if err.kind() == std::io::ErrorKind::NotFound {
				CollectorError::ConfigMissing(path.to_path_buf())
			} else {
				CollectorError::Io(err)
			}
		})?;
		Ok(serde_yaml::from_str(&raw)?)
	}

	/// # Errors
	/// `BadRedisServer` when `redis_server` is not `host:port`.
	pub fn redis_host_port(&self) -> Result<(String, u16), CollectorError> {
		let (host, port) = self
			.redis_server
			.rsplit_once(':')
			.ok_or_else(|| CollectorError::BadRedisServer(self.redis_server.clone()))?;
		let port: u16 = port.parse().map_err(|_| CollectorError::BadRedisServer(self.redis_server.clone()))?;
		if host.is_empty() {
			return Err(CollectorError::BadRedisServer(self.redis_server.clone()));
		}
		Ok((host.to_string(), port))
	}

	#[must_use]
	pub fn redis_url(&self) -> String {
		format!("redis://{}/", self.redis_server)
	}

	#[must_use]
	pub fn ingress_addr(&self) -> SocketAddr {
		SocketAddr::from(([0, 0, 0, 0], self.port))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn test_defaults_apply_for_missing_keys() {
		let cfg: CollectorConfig = serde_yaml::from_str("port: 9000\nendpoint: s3-east\n").unwrap();
		assert_eq!(cfg.port, 9_000);
		assert_eq!(cfg.endpoint, "s3-east");
		assert_eq!(cfg.metrics_batch_period_msec, 31);
		assert_eq!(cfg.redis_qos_conn_ttl, 60);
	}

	#[test]
	fn test_missing_file_maps_to_enoent() {
		let err = CollectorConfig::load(Path::new("/nonexistent/weir.yaml")).unwrap_err();
		assert_eq!(err.exit_code(), 2);
	}

	#[test]
	fn test_bad_yaml_maps_to_einval() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(b"port: [not a port\n").unwrap();
		let err = CollectorConfig::load(file.path()).unwrap_err();
		assert_eq!(err.exit_code(), 22);
	}

	#[test]
	fn test_redis_host_port_parsing() {
		let mut cfg = CollectorConfig::default();
		assert_eq!(cfg.redis_host_port().unwrap(), ("127.0.0.1".to_string(), 6_379));

		cfg.redis_server = "no-port-here".to_string();
		assert_eq!(cfg.redis_host_port().unwrap_err().exit_code(), 22);

		cfg.redis_server = "host:notaport".to_string();
		assert!(cfg.redis_host_port().is_err());
	}
}
