//! Fire-and-forget UDP event emission to the local collector.

use crate::error::EnforcerError;
use std::net::{SocketAddr, UdpSocket};
use weir_proto::EdgeEvent;

pub struct EventEmitter {
	sock: UdpSocket,
	target: SocketAddr,
}

impl EventEmitter {
	/// # Errors
	/// Socket creation fails. Send failures later are logged and
	/// dropped; losing an event is always preferable to blocking the
	/// request path.
	pub fn new(target: SocketAddr) -> Result<Self, EnforcerError> {
		let bind_addr: SocketAddr = if target.is_ipv4() { "0.0.0.0:0".parse().unwrap_or(target) } else { "[::]:0".parse().unwrap_or(target) };
		let sock = UdpSocket::bind(bind_addr)?;
		sock.set_nonblocking(true)?;
		sock.connect(target)?;
		Ok(Self { sock, target })
	}

	pub fn emit(&self, event: &EdgeEvent) {
		let line = event.to_line();
		if let Err(err) = self.sock.send(line.as_bytes()) {
			tracing::debug!(%err, target = %self.target, "dropping edge event");
		}
	}
}
