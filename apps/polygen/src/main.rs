//! Policy generator daemon: reads aggregated usage from the shared KV
//! store each tick, compares it against the configured limits, and
//! broadcasts violations and per-edge bandwidth shares to every
//! connected edge.

mod broadcast;
mod config;
mod error;
mod policy;
mod reload;
mod usage;

use crate::broadcast::Broadcaster;
use crate::config::PolygenConfig;
use crate::error::PolygenError;
use crate::policy::PolicyEngine;
use redis::aio::MultiplexedConnection;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use weir_model::LimitsTable;
use weir_proto::{frame_limit_share, frame_policies};

fn main() {
	std::process::exit(run());
}

fn run() -> i32 {
	let Some(path) = std::env::args().nth(1) else {
		eprintln!("usage: weir-polygen <config.yaml>");
		return 22;
	};
	let cfg = match PolygenConfig::load(Path::new(&path)) {
		Ok(cfg) => cfg,
		Err(err) => {
			eprintln!("{err}");
			return err.exit_code();
		}
	};
	init_tracing(&cfg);
	match serve(cfg) {
		Ok(()) => 0,
		Err(err) => {
			tracing::error!(%err, "policy generator failed");
			err.exit_code()
		}
	}
}

#[tokio::main]
async fn serve(cfg: PolygenConfig) -> Result<(), PolygenError> {
	let redis_url = cfg.redis_url()?;
	let client = redis::Client::open(redis_url.as_str())?;

	let mut limits = load_limits(&cfg);
	let reload_armed = Arc::new(AtomicBool::new(false));
	let cancel = CancellationToken::new();
	let _reload_task = reload::spawn_reload_listener(cfg.reload_fifo_path(), Arc::clone(&reload_armed), cancel.clone())?;

	let listener = TcpListener::bind(("0.0.0.0", cfg.port)).await.map_err(PolygenError::Socket)?;
	let broadcaster = Broadcaster::new();
	broadcaster.spawn_listener(listener, cancel.clone());
	tracing::info!(port = cfg.port, zone = %cfg.zone, endpoint = %cfg.endpoint, "policy generator running");

	let mut engine = PolicyEngine::new();
	let mut conn: Option<MultiplexedConnection> = None;
	let mut ticker = tokio::time::interval(Duration::from_millis(cfg.tick_msec.max(1)));
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => break,
			_ = ticker.tick() => {}
		}

		if reload_armed.swap(false, Ordering::AcqRel) {
			match LimitsTable::load(&cfg.limits_path()) {
				Ok(table) => {
					tracing::info!(path = %cfg.limits_path().display(), "limits reloaded");
					limits = table;
				}
				Err(err) => tracing::warn!(%err, "limits reload failed, keeping previous table"),
			}
		}

		tick(&client, &mut conn, &mut engine, &limits, &cfg, &broadcaster).await;
	}

	tracing::info!("shutting down");
	cancel.cancel();
	Ok(())
}

/// One control-loop tick. Every failure path just skips the tick;
/// state is rebuilt from the store next time.
async fn tick(
	client: &redis::Client,
	conn: &mut Option<MultiplexedConnection>,
	engine: &mut PolicyEngine,
	limits: &LimitsTable,
	cfg: &PolygenConfig,
	broadcaster: &Broadcaster,
) {
	if conn.is_none() {
		match client.get_multiplexed_tokio_connection().await {
			Ok(fresh) => *conn = Some(fresh),
			Err(err) => {
				tracing::warn!(%err, "redis connect failed, skipping tick");
				return;
			}
		}
	}
	let Some(active_conn) = conn.as_mut() else {
		return;
	};
	let snapshot = match usage::scan(active_conn, &cfg.endpoint).await {
		Ok(snapshot) => snapshot,
		Err(err) => {
			tracing::warn!(%err, "usage scan failed, skipping tick");
			*conn = None;
			return;
		}
	};

	let out = engine.compute(&snapshot, limits, cfg, now_us());
	if let Some(block) = frame_policies(&out.policies) {
		broadcaster.broadcast(&Arc::from(block.as_str()));
	}
	if let Some(block) = frame_limit_share(&out.shares) {
		broadcaster.broadcast(&Arc::from(block.as_str()));
	}
}

fn load_limits(cfg: &PolygenConfig) -> LimitsTable {
	match LimitsTable::load(&cfg.limits_path()) {
		Ok(table) => table,
		Err(err) => {
			tracing::warn!(%err, path = %cfg.limits_path().display(), "limits file unavailable, starting with an empty table");
			LimitsTable::default()
		}
	}
}

fn now_us() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
		.unwrap_or_default()
}

fn init_tracing(cfg: &PolygenConfig) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
	tracing_subscriber::fmt().with_env_filter(filter).init();
}
