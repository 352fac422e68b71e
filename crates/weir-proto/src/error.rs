use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
	#[error("unknown event type: {0:?}")]
	UnknownEvent(String),
	#[error("{event}: expected {expected} fields, got {got}")]
	FieldCount { event: &'static str, expected: usize, got: usize },
	#[error("{event}: field {field:?} is not an integer: {value:?}")]
	BadInt {
		event: &'static str,
		field: &'static str,
		value: String,
	},
	#[error("non-printable user key: {0:?}")]
	BadUserKey(String),
	#[error(transparent)]
	Model(#[from] weir_model::ModelError),
	#[error("malformed policy record: {0:?}")]
	BadPolicyRecord(String),
}
