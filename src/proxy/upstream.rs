//! Upstream connection establishment: fresh TCP per request, TLS with
//! system-trust verification for https, bounded retries on connect failure.

use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use super::ProxyError;
use super::stream::Stream;
use crate::http::Scheme;
use crate::tls;

/// Connect failures are retried at most this many extra times, within
/// [`RETRY_BUDGET`] of the first failure.
const MAX_RETRIES: u32 = 2;
const RETRY_BUDGET: Duration = Duration::from_millis(500);
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Opens a connection to `(host, port)`, wrapping it in a verified TLS
/// session for https. SNI and hostname verification use the target host
/// against the system trust store, never the local root.
pub async fn connect(
	scheme: Scheme,
	host: &str,
	port: u16,
	connect_timeout: Duration,
) -> Result<BufReader<Stream>, ProxyError> {
	let tcp = connect_tcp(host, port, connect_timeout).await?;
	let stream = match scheme {
		Scheme::Http => Stream::Tcp(tcp),
		Scheme::Https => {
			let tls = tls::connect_upstream(host, tcp)
				.await
				.map_err(ProxyError::UpstreamTls)?;
			Stream::TlsClient(Box::new(tls))
		},
	};
	Ok(BufReader::new(stream))
}

async fn connect_tcp(
	host: &str,
	port: u16,
	connect_timeout: Duration,
) -> Result<TcpStream, ProxyError> {
	let addr = format!("{host}:{port}");
	let mut retry_deadline: Option<Instant> = None;
	let mut attempt = 0u32;
	loop {
		attempt += 1;
		match timeout(connect_timeout, TcpStream::connect(&addr)).await {
			Ok(Ok(stream)) => return Ok(stream),
			Ok(Err(e)) => {
				let deadline = *retry_deadline.get_or_insert_with(|| Instant::now() + RETRY_BUDGET);
				if attempt > MAX_RETRIES || Instant::now() + RETRY_PAUSE >= deadline {
					return Err(ProxyError::UpstreamUnreachable(e));
				}
				debug!(addr = %addr, attempt, "upstream connect failed, retrying: {e}");
				sleep(RETRY_PAUSE).await;
			},
			// A hang consumes the whole attempt budget; no retry.
			Err(_) => return Err(ProxyError::UpstreamTimeout),
		}
	}
}
