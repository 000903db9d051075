//! The listener: accepts TCP connections and dispatches each to its own
//! handler task, with cooperative drain on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ProxyInputs;
use crate::proxy::ConnectionHandler;

const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Binds the configured address and serves until `shutdown` fires.
pub async fn run(pi: Arc<ProxyInputs>, shutdown: CancellationToken) -> anyhow::Result<()> {
	let listener = TcpListener::bind(pi.cfg.listen).await?;
	serve(pi, listener, shutdown).await
}

/// Runs the accept loop on an already-bound listener until `shutdown`
/// fires, then drains in-flight connections: no new accepts, each handler
/// finishes its current exchange.
pub async fn serve(
	pi: Arc<ProxyInputs>,
	listener: TcpListener,
	shutdown: CancellationToken,
) -> anyhow::Result<()> {
	info!(addr = %listener.local_addr()?, "proxy listening");

	let mut connections: JoinSet<()> = JoinSet::new();
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!("accept failed: {e}");
						continue;
					},
				};
				let _ = stream.set_nodelay(true);
				let handler = ConnectionHandler::new(pi.clone(), shutdown.child_token());
				connections.spawn(handler.run(stream, peer));
			},
			Some(res) = connections.join_next(), if !connections.is_empty() => {
				if let Err(e) = res {
					warn!("connection task failed: {e}");
				}
			},
			_ = shutdown.cancelled() => break,
		}
	}
	drop(listener);

	info!(in_flight = connections.len(), "listener stopped, draining");
	let drain = async {
		while connections.join_next().await.is_some() {}
	};
	if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
		warn!("drain deadline exceeded, aborting remaining connections");
		connections.shutdown().await;
	}
	info!("shutdown complete");
	Ok(())
}
