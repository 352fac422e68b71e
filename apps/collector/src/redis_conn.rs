//! One redis connection per worker, with DNS-aware reconnection.
//!
//! A background checker re-resolves the configured host on an
//! interval; when the address changes it raises a flag and the next
//! flush drops the old connection and dials the new endpoint. Command
//! errors never kill the worker; they count failures and force a
//! reconnect on the next flush.

use crate::config::CollectorConfig;
use crate::error::CollectorError;
use redis::aio::MultiplexedConnection;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct RedisConn {
	client: redis::Client,
	host: String,
	port: u16,
	conn: Option<MultiplexedConnection>,
	connected_ip: Arc<Mutex<Option<IpAddr>>>,
	force_reconnect: Arc<AtomicBool>,
	failures: u64,
}

impl RedisConn {
	/// # Errors
	/// Unparseable `redis_server` or a rejected connection URL.
	pub fn new(cfg: &CollectorConfig) -> Result<Self, CollectorError> {
		let (host, port) = cfg.redis_host_port()?;
		let client = redis::Client::open(cfg.redis_url())?;
		Ok(Self {
			client,
			host,
			port,
			conn: None,
			connected_ip: Arc::new(Mutex::new(None)),
			force_reconnect: Arc::new(AtomicBool::new(false)),
			failures: 0,
		})
	}

	/// Make sure a connection exists, honoring a pending reconnect
	/// request. Returns whether the store is reachable right now.
	pub async fn ready(&mut self) -> bool {
		if self.force_reconnect.swap(false, Ordering::AcqRel) && self.conn.take().is_some() {
			tracing::info!(host = %self.host, "redis endpoint moved, dropping connection");
		}
		if self.conn.is_none() {
			match self.client.get_multiplexed_tokio_connection().await {
				Ok(conn) => {
					*self.connected_ip.lock().unwrap_or_else(PoisonError::into_inner) = self.resolve_one().await;
					self.conn = Some(conn);
				}
				Err(err) => {
					tracing::warn!(%err, host = %self.host, "redis connect failed");
					return false;
				}
			}
		}
		true
	}

	/// Ship one pipeline. On error the connection is dropped so the
	/// next flush reconnects.
	pub async fn send(&mut self, pipe: redis::Pipeline) -> bool {
		let Some(conn) = self.conn.as_mut() else {
			return false;
		};
		let outcome: Result<(), redis::RedisError> = pipe.query_async(conn).await;
		match outcome {
			Ok(()) => true,
			Err(err) => {
				self.failures += 1;
				tracing::warn!(%err, failures = self.failures, "redis pipeline failed");
				self.conn = None;
				false
			}
		}
	}

	async fn resolve_one(&self) -> Option<IpAddr> {
		match tokio::net::lookup_host((self.host.as_str(), self.port)).await {
			Ok(mut addrs) => addrs.next().map(|a| a.ip()),
			Err(err) => {
				tracing::warn!(%err, host = %self.host, "redis host lookup failed");
				None
			}
		}
	}

	/// Periodic DNS check: a changed address flags the connection for
	/// replacement at the next flush.
	pub fn spawn_health_checker(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
		let host = self.host.clone();
		let port = self.port;
		let connected_ip = Arc::clone(&self.connected_ip);
		let force = Arc::clone(&self.force_reconnect);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					() = cancel.cancelled() => return,
					_ = ticker.tick() => {}
				}
				let resolved = match tokio::net::lookup_host((host.as_str(), port)).await {
					Ok(mut addrs) => addrs.next().map(|a| a.ip()),
					Err(err) => {
						tracing::warn!(%err, host = %host, "redis host lookup failed");
						continue;
					}
				};
				let current = *connected_ip.lock().unwrap_or_else(PoisonError::into_inner);
				if let (Some(resolved), Some(current)) = (resolved, current) {
					if resolved != current {
						tracing::info!(%resolved, %current, "redis address changed");
						force.store(true, Ordering::Release);
					}
				}
			}
		})
	}
}
