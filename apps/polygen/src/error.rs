use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolygenError {
	#[error("config file not found: {0}")]
	ConfigMissing(PathBuf),
	#[error("config file is not valid YAML: {0}")]
	ConfigInvalid(#[from] serde_yaml::Error),
	#[error("unparseable redis_server address: {0:?}")]
	BadRedisServer(String),
	#[error("listener socket error: {0}")]
	Socket(std::io::Error),
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("redis error: {0}")]
	Redis(#[from] redis::RedisError),
	#[error("limits table error: {0}")]
	Limits(#[from] weir_model::ModelError),
}

impl PolygenError {
	#[must_use]
	pub fn exit_code(&self) -> i32 {
		match self {
			Self::ConfigMissing(_) => 2,
			Self::ConfigInvalid(_) | Self::BadRedisServer(_) => 22,
			Self::Socket(err) => err.raw_os_error().unwrap_or(1),
			Self::Io(_) | Self::Redis(_) | Self::Limits(_) => 1,
		}
	}
}
