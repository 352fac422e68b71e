//! UDP ingress socket construction.
//!
//! Each worker binds its own `SO_REUSEPORT` socket so the kernel
//! spreads datagrams across them. The receive buffer is negotiated up
//! front: we ask for twice the kernel's advertised maximum (the kernel
//! doubles requests and caps at 2x `rmem_max`), then size the
//! userspace read buffer to whatever the socket actually got so one
//! receive always holds one whole datagram.

use crate::error::CollectorError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

const RMEM_MAX_PATH: &str = "/proc/sys/net/core/rmem_max";
const RMEM_FALLBACK: usize = 212_992;

fn kernel_rmem_max() -> usize {
	std::fs::read_to_string(RMEM_MAX_PATH)
		.ok()
		.and_then(|s| s.trim().parse().ok())
		.unwrap_or(RMEM_FALLBACK)
}

/// Bind the ingress socket and return it with the buffer size a read
/// must use to never truncate a datagram.
///
/// # Errors
/// Any socket syscall failure; the caller exits with its errno.
pub fn bind_ingress(addr: SocketAddr) -> Result<(std::net::UdpSocket, usize), CollectorError> {
	let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(CollectorError::Socket)?;
	socket.set_reuse_port(true).map_err(CollectorError::Socket)?;
	let requested = kernel_rmem_max().saturating_mul(2);
	if let Err(err) = socket.set_recv_buffer_size(requested) {
		tracing::warn!(%err, requested, "could not grow the receive buffer");
	}
	socket.bind(&addr.into()).map_err(CollectorError::Socket)?;
	socket.set_nonblocking(true).map_err(CollectorError::Socket)?;
	let actual = socket.recv_buffer_size().map_err(CollectorError::Socket)?;
	tracing::debug!(requested, actual, "ingress socket bound");
	Ok((socket.into(), actual))
}
