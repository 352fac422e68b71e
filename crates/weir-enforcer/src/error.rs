use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnforcerError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("enforcer already shut down")]
	ShutDown,
}
