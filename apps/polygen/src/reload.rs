//! Live limits reload over a named FIFO.
//!
//! Writing the literal line `reload_limits` to the well-known FIFO
//! arms a reload; the control loop re-reads the limits JSON at its
//! next tick. The FIFO is created at startup if absent.

use nix::sys::stat::Mode;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const RELOAD_COMMAND: &str = "reload_limits";

/// Create the FIFO if needed and watch it for reload commands.
///
/// # Errors
/// FIFO creation failure (other than it already existing).
pub fn spawn_reload_listener(path: PathBuf, armed: Arc<AtomicBool>, cancel: CancellationToken) -> std::io::Result<JoinHandle<()>> {
	match nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IWGRP | Mode::S_IWOTH) {
		Ok(()) => {}
		Err(nix::errno::Errno::EEXIST) => {}
		Err(errno) => return Err(std::io::Error::from(errno)),
	}
	Ok(tokio::spawn(watch_fifo(path, armed, cancel)))
}

async fn watch_fifo(path: PathBuf, armed: Arc<AtomicBool>, cancel: CancellationToken) {
	loop {
		if cancel.is_cancelled() {
			return;
		}
		let receiver = match tokio::net::unix::pipe::OpenOptions::new().open_receiver(&path) {
			Ok(receiver) => receiver,
			Err(err) => {
				tracing::warn!(%err, path = %path.display(), "cannot open reload FIFO");
				tokio::select! {
					() = cancel.cancelled() => return,
					() = tokio::time::sleep(Duration::from_secs(5)) => continue,
				}
			}
		};
		read_commands(receiver, &armed, &cancel).await;
		// Read error; back off before reopening.
		tokio::select! {
			() = cancel.cancelled() => return,
			() = tokio::time::sleep(Duration::from_millis(200)) => {}
		}
	}
}

async fn read_commands(mut receiver: tokio::net::unix::pipe::Receiver, armed: &Arc<AtomicBool>, cancel: &CancellationToken) {
	let mut pending = String::new();
	let mut buf = [0_u8; 256];
	loop {
		let read = tokio::select! {
			() = cancel.cancelled() => return,
			read = receiver.read(&mut buf) => read,
		};
		match read {
			Ok(0) => {
				// No writers right now. Keep the read end open so a
				// writer's open never races our close, and poll.
				tokio::select! {
					() = cancel.cancelled() => return,
					() = tokio::time::sleep(Duration::from_millis(100)) => {}
				}
			}
			Ok(n) => {
				pending.push_str(&String::from_utf8_lossy(&buf[..n]));
				while let Some(pos) = pending.find('\n') {
					let line = pending[..pos].trim().to_string();
					pending.drain(..=pos);
					if line == RELOAD_COMMAND {
						tracing::info!("limits reload armed");
						armed.store(true, Ordering::Release);
					} else if !line.is_empty() {
						tracing::warn!(line, "unknown reload FIFO command");
					}
				}
			}
			Err(err) => {
				tracing::warn!(%err, "reload FIFO read error");
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[tokio::test]
	async fn test_reload_command_arms_the_flag() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("reload.fifo");
		let armed = Arc::new(AtomicBool::new(false));
		let cancel = CancellationToken::new();
		let task = spawn_reload_listener(path.clone(), Arc::clone(&armed), cancel.clone()).unwrap();

		// FIFO opens block until a reader exists, so write from a
		// blocking thread.
		let writer_path = path.clone();
		tokio::task::spawn_blocking(move || {
			let mut fifo = std::fs::OpenOptions::new().write(true).open(&writer_path).unwrap();
			writeln!(fifo, "reload_limits").unwrap();
		})
		.await
		.unwrap();

		let mut ok = false;
		for _ in 0..100 {
			if armed.load(Ordering::Acquire) {
				ok = true;
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert!(ok, "reload flag never armed");

		cancel.cancel();
		task.await.unwrap();
	}

	#[tokio::test]
	async fn test_unknown_command_is_ignored() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("reload.fifo");
		let armed = Arc::new(AtomicBool::new(false));
		let cancel = CancellationToken::new();
		let task = spawn_reload_listener(path.clone(), Arc::clone(&armed), cancel.clone()).unwrap();

		let writer_path = path.clone();
		tokio::task::spawn_blocking(move || {
			let mut fifo = std::fs::OpenOptions::new().write(true).open(&writer_path).unwrap();
			writeln!(fifo, "do_something_else").unwrap();
		})
		.await
		.unwrap();

		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(!armed.load(Ordering::Acquire));

		cancel.cancel();
		task.await.unwrap();
	}
}
