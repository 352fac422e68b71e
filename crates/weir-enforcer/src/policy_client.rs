//! Policy channel client.
//!
//! One long-lived TCP connection to the policy generator, reading
//! line-delimited policy blocks and applying them to the local tables.
//! On disconnect the client retries with jittered exponential back-off;
//! while disconnected the edge keeps enforcing what it last heard, and
//! the short-lived tables (reqs-block, rate violations) expire on their
//! own.

use crate::edge::EdgeInner;
use crate::time::{epoch_sec, US_PER_SEC};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use weir_proto::{Policy, PolicyFramer};

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 5_000;

pub(crate) async fn run(inner: Arc<EdgeInner>, cancel: CancellationToken) {
	let mut backoff_ms = INITIAL_BACKOFF_MS;
	loop {
		tokio::select! {
			() = cancel.cancelled() => return,
			conn = TcpStream::connect(inner.cfg.policy_addr) => match conn {
				Ok(stream) => {
					tracing::info!(addr = %inner.cfg.policy_addr, "policy channel connected");
					backoff_ms = INITIAL_BACKOFF_MS;
					read_policies(stream, &inner, &cancel).await;
					if cancel.is_cancelled() {
						return;
					}
					tracing::warn!("policy channel closed, will reconnect");
				}
				Err(err) => {
					tracing::warn!(%err, addr = %inner.cfg.policy_addr, "policy channel connect failed");
				}
			}
		}
		let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2);
		let delay = Duration::from_millis(backoff_ms + jitter);
		backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
		tokio::select! {
			() = cancel.cancelled() => return,
			() = tokio::time::sleep(delay) => {}
		}
	}
}

async fn read_policies(stream: TcpStream, inner: &Arc<EdgeInner>, cancel: &CancellationToken) {
	let mut lines = BufReader::new(stream).lines();
	let mut framer = PolicyFramer::new();
	loop {
		tokio::select! {
			() = cancel.cancelled() => return,
			line = lines.next_line() => match line {
				Ok(Some(line)) => {
					if let Some(policy) = framer.push_line(&line) {
						apply(inner, policy);
					}
				}
				Ok(None) => return,
				Err(err) => {
					tracing::warn!(%err, "policy channel read error");
					return;
				}
			}
		}
	}
}

fn apply(inner: &Arc<EdgeInner>, policy: Policy) {
	if let Policy::LimitShare { ts_sec, user, shares } = policy {
		let ts_us = ts_sec.saturating_mul(US_PER_SEC);
		for share in shares {
			// Each record carries every instance's slice; only ours
			// applies here.
			if share.instance == inner.cfg.instance {
				inner.table.apply_limit_share(&user, share.dir, ts_us, share.bytes_per_sec, inner.cfg.minimum_limit);
			}
		}
	} else {
		inner.violations.ingest(&policy, epoch_sec());
	}
}
