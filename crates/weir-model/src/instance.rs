use std::fmt;

/// Identifier for one edge process: `<hostname>-<port>`.
///
/// Underscores in the hostname are substituted with dashes so the
/// compound-key separator (`_`) never appears inside an instance id and
/// keys stay splittable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
	#[must_use]
	pub fn new(hostname: &str, port: u16) -> Self {
		let host = hostname.replace('_', "-");
		Self(format!("{host}-{port}"))
	}

	/// Build from the local hostname, falling back to `localhost` if the
	/// kernel will not tell us.
	#[must_use]
	pub fn local(port: u16) -> Self {
		let host = nix::unistd::gethostname()
			.ok()
			.and_then(|h| h.into_string().ok())
			.unwrap_or_else(|| "localhost".to_string());
		Self::new(&host, port)
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for InstanceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for InstanceId {
	fn from(s: &str) -> Self {
		Self(s.replace('_', "-"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_instance_id_format() {
		assert_eq!(InstanceId::new("edge-host", 8080).as_str(), "edge-host-8080");
	}

	#[test]
	fn test_underscores_are_substituted() {
		assert_eq!(InstanceId::new("edge_host_1", 80).as_str(), "edge-host-1-80");
		assert!(!InstanceId::new("a_b", 1).as_str().contains('_'));
	}
}
