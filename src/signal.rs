//! Process shutdown signal handling.
//!
//! Watchgate drains on the first SIGINT or SIGTERM; a second SIGINT skips
//! the drain and exits at once.

use tracing::info;

/// Completes when the process should begin draining. After the first
/// SIGINT, a background watcher turns a repeat SIGINT into an immediate
/// exit.
#[cfg(unix)]
pub async fn shutdown_requested() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
	let mut terminate = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
	tokio::select! {
		_ = interrupt.recv() => {
			info!("received SIGINT, shutting down");
			tokio::spawn(async {
				let mut repeat =
					signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
				repeat.recv().await;
				info!("second SIGINT, exiting immediately");
				std::process::exit(0);
			});
		},
		_ = terminate.recv() => info!("received SIGTERM, shutting down"),
	}
}

#[cfg(not(unix))]
pub async fn shutdown_requested() {
	tokio::signal::ctrl_c()
		.await
		.expect("failed to register ctrl-c handler");
	info!("received ctrl-c, shutting down");
}
