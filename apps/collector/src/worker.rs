//! One collector worker: a port-reused socket, a bounded FIFO between
//! the receiver and the consumer, and a private redis connection.

use crate::aggregate::Aggregates;
use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::logs::LogSinks;
use crate::redis_conn::RedisConn;
use crate::socket;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weir_proto::{classify_line, EdgeEvent, WireLine};

/// Consumer poll granularity; keeps flush deadlines honest while the
/// queue is quiet.
const DEQUEUE_TIMEOUT: Duration = Duration::from_micros(100);

pub struct WorkerHandle {
	pub id: usize,
	tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
	pub async fn join(self) {
		for task in self.tasks {
			if let Err(err) = task.await {
				tracing::warn!(worker = self.id, %err, "worker task ended abnormally");
			}
		}
	}
}

/// # Errors
/// Socket setup or redis URL problems; both are fatal at startup.
pub fn spawn(id: usize, cfg: &Arc<CollectorConfig>, logs: &Arc<LogSinks>, cancel: &CancellationToken) -> Result<WorkerHandle, CollectorError> {
	let (std_sock, buf_size) = socket::bind_ingress(cfg.ingress_addr())?;
	let udp = UdpSocket::from_std(std_sock)?;
	let (tx, rx) = mpsc::channel(cfg.msg_queue_size.max(1));
	let redis = RedisConn::new(cfg)?;
	let health = redis.spawn_health_checker(Duration::from_secs(cfg.redis_check_conn_interval_sec.max(1)), cancel.clone());

	let producer = tokio::spawn(produce(id, udp, buf_size, tx, Arc::clone(logs), cancel.clone()));
	let consumer = tokio::spawn(consume(id, rx, redis, Arc::clone(cfg), cancel.clone()));
	Ok(WorkerHandle {
		id,
		tasks: vec![producer, consumer, health],
	})
}

async fn produce(id: usize, udp: UdpSocket, buf_size: usize, tx: mpsc::Sender<String>, logs: Arc<LogSinks>, cancel: CancellationToken) {
	let mut buf = vec![0_u8; buf_size];
	loop {
		let received = tokio::select! {
			() = cancel.cancelled() => return,
			received = udp.recv_from(&mut buf) => received,
		};
		let n = match received {
			Ok((n, _)) => n,
			Err(err) => {
				tracing::warn!(worker = id, %err, "ingress receive failed");
				continue;
			}
		};
		if n >= buf.len() {
			tracing::warn!(worker = id, size = n, "dropping datagram at buffer capacity");
			continue;
		}
		let Ok(payload) = std::str::from_utf8(&buf[..n]) else {
			tracing::warn!(worker = id, size = n, "dropping non-UTF-8 datagram");
			continue;
		};
		let line = payload.trim_end_matches(['\r', '\n']);
		match classify_line(line) {
			WireLine::Event(event) => {
				if tx.try_send(event.to_string()).is_err() {
					tracing::warn!(worker = id, "event queue full, dropping");
				}
			}
			WireLine::AccessLog(line) => logs.access_line(line),
			WireLine::Log(line) => logs.general_line(line),
		}
	}
}

async fn consume(id: usize, mut rx: mpsc::Receiver<String>, mut redis: RedisConn, cfg: Arc<CollectorConfig>, cancel: CancellationToken) {
	let mut agg = Aggregates::new();
	loop {
		let dequeued = tokio::select! {
			() = cancel.cancelled() => break,
			dequeued = tokio::time::timeout(DEQUEUE_TIMEOUT, rx.recv()) => dequeued,
		};
		match dequeued {
			Ok(Some(line)) => match EdgeEvent::parse(&line) {
				Ok(event) => agg.apply(event, now_ms(), &cfg.endpoint),
				Err(err) => tracing::warn!(worker = id, %err, line, "skipping malformed event"),
			},
			Ok(None) => break,
			Err(_elapsed) => {}
		}
		if agg.flush_due(cfg.metrics_batch_count, cfg.metrics_batch_period_msec) {
			flush(&mut agg, &mut redis, &cfg).await;
		}
	}
	if agg.pending() > 0 {
		flush(&mut agg, &mut redis, &cfg).await;
	}
	tracing::debug!(worker = id, "consumer stopped");
}

async fn flush(agg: &mut Aggregates, redis: &mut RedisConn, cfg: &CollectorConfig) {
	if redis.ready().await {
		let (pipe, updates) = agg.drain_into_pipeline(&cfg.endpoint, i64::try_from(cfg.redis_qos_ttl).unwrap_or(i64::MAX), cfg.redis_qos_conn_ttl);
		if updates > 0 && redis.send(pipe).await {
			tracing::trace!(updates, "flushed aggregates");
		}
	} else {
		agg.discard_stale(cfg.redis_qos_ttl, now_ms());
	}
}

fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
		.unwrap_or_default()
}
