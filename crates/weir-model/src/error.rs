use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
	#[error("unknown direction: {0:?}")]
	UnknownDirection(String),
	#[error("malformed key: {0:?}")]
	MalformedKey(String),
}
