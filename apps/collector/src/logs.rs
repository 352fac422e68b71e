//! Forwarding sinks for non-event datagrams: JSON access-log lines and
//! plain log lines from the proxy ride the same socket as events.

use crate::config::CollectorConfig;
use crate::error::CollectorError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

pub struct LogSinks {
	access: Option<Mutex<File>>,
	general: Option<Mutex<File>>,
}

impl LogSinks {
	/// # Errors
	/// A configured log file cannot be opened.
	pub fn open(cfg: &CollectorConfig) -> Result<Self, CollectorError> {
		Ok(Self {
			access: open_sink(&cfg.access_log_file_name)?,
			general: open_sink(&cfg.log_file_name)?,
		})
	}

	pub fn access_line(&self, line: &str) {
		write_line(self.access.as_ref(), line);
	}

	pub fn general_line(&self, line: &str) {
		write_line(self.general.as_ref(), line);
	}
}

fn open_sink(name: &str) -> Result<Option<Mutex<File>>, CollectorError> {
	if name.is_empty() {
		return Ok(None);
	}
	let file = OpenOptions::new().create(true).append(true).open(name)?;
	Ok(Some(Mutex::new(file)))
}

fn write_line(sink: Option<&Mutex<File>>, line: &str) {
	match sink {
		Some(file) => {
			let mut file = file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
			if let Err(err) = writeln!(file, "{line}") {
				tracing::debug!(%err, "log sink write failed");
			}
		}
		None => tracing::debug!(line, "forwarded log line"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_lines_append_to_configured_files() {
		let dir = tempfile::tempdir().unwrap();
		let access_path = dir.path().join("access.log");
		let cfg = CollectorConfig {
			access_log_file_name: access_path.to_string_lossy().into_owned(),
			..CollectorConfig::default()
		};

		let sinks = LogSinks::open(&cfg).unwrap();
		sinks.access_line(r#"{"status":200}"#);
		sinks.access_line(r#"{"status":404}"#);
		// No general log configured: this must not panic.
		sinks.general_line("plain line");

		let written = std::fs::read_to_string(&access_path).unwrap();
		assert_eq!(written, "{\"status\":200}\n{\"status\":404}\n");
	}
}
