//! Policy channel fan-out.
//!
//! Edges dial in and hold the connection; each tick's blocks are
//! offered to every live session. A session that cannot keep up (or
//! hung up) is dropped; the edge reconnects and converges on the next
//! tick.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-session outbound queue bound; a tick produces at most two
/// blocks, so small is plenty.
const SESSION_QUEUE: usize = 16;

#[derive(Clone)]
pub struct Broadcaster {
	sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Arc<str>>>>,
}

impl Broadcaster {
	#[must_use]
	pub fn new() -> Self {
		Self { sessions: Arc::new(DashMap::new()) }
	}

	pub fn spawn_listener(&self, listener: TcpListener, cancel: CancellationToken) -> JoinHandle<()> {
		let sessions = Arc::clone(&self.sessions);
		tokio::spawn(async move {
			loop {
				let accepted = tokio::select! {
					() = cancel.cancelled() => return,
					accepted = listener.accept() => accepted,
				};
				match accepted {
					Ok((stream, peer)) => {
						tracing::info!(%peer, "edge connected to policy channel");
						let (tx, rx) = mpsc::channel(SESSION_QUEUE);
						sessions.insert(peer, tx);
						tokio::spawn(write_session(stream, peer, rx, Arc::clone(&sessions), cancel.clone()));
					}
					Err(err) => tracing::warn!(%err, "policy channel accept failed"),
				}
			}
		})
	}

	/// Offer one framed block to every session.
	pub fn broadcast(&self, block: &Arc<str>) {
		self.sessions.retain(|peer, tx| match tx.try_send(Arc::clone(block)) {
			Ok(()) => true,
			Err(err) => {
				tracing::warn!(%peer, %err, "dropping policy session");
				false
			}
		});
	}

	#[must_use]
	pub fn session_count(&self) -> usize {
		self.sessions.len()
	}
}

impl Default for Broadcaster {
	fn default() -> Self {
		Self::new()
	}
}

async fn write_session(
	mut stream: TcpStream,
	peer: SocketAddr,
	mut rx: mpsc::Receiver<Arc<str>>,
	sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Arc<str>>>>,
	cancel: CancellationToken,
) {
	loop {
		let block = tokio::select! {
			() = cancel.cancelled() => break,
			block = rx.recv() => match block {
				Some(block) => block,
				None => break,
			}
		};
		if let Err(err) = stream.write_all(block.as_bytes()).await {
			tracing::info!(%peer, %err, "policy session write failed");
			break;
		}
	}
	sessions.remove(&peer);
	tracing::info!(%peer, "policy session closed");
}
