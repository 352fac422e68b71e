//! Event collector daemon: drains the edge's UDP event stream, batches
//! aggregates, and applies them to the shared KV store.

mod aggregate;
mod config;
mod error;
mod logs;
mod redis_conn;
mod socket;
mod worker;

use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::logs::LogSinks;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() {
	std::process::exit(run());
}

fn run() -> i32 {
	let Some(path) = std::env::args().nth(1) else {
		eprintln!("usage: weir-collector <config.yaml>");
		return 22;
	};
	let cfg = match CollectorConfig::load(Path::new(&path)) {
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
			tracing::error!(%err, "collector failed");
			err.exit_code()
		}
	}
}

#[tokio::main]
async fn serve(cfg: CollectorConfig) -> Result<(), CollectorError> {
	let cfg = Arc::new(cfg);
	let logs = Arc::new(LogSinks::open(&cfg)?);
	let cancel = CancellationToken::new();

	let mut workers = Vec::new();
	for id in 0..cfg.num_of_syslog_servers.max(1) {
		workers.push(worker::spawn(id, &cfg, &logs, &cancel)?);
	}
	tracing::info!(port = cfg.port, workers = workers.len(), endpoint = %cfg.endpoint, "collector running");

	tokio::signal::ctrl_c().await.ok();
	tracing::info!("shutting down");
	cancel.cancel();
	for handle in workers {
		handle.join().await;
	}
	tracing::info!("shutdown complete");
	Ok(())
}

fn init_tracing(cfg: &CollectorConfig) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
	tracing_subscriber::fmt().with_env_filter(filter).init();
}
