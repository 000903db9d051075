//! The per-connection state machine: plaintext or CONNECT detection, TLS
//! impersonation, policy evaluation, the review rendezvous, and the
//! forward/relay loop.
//!
//! One handler owns one client socket for its lifetime. Any number run
//! concurrently; they share the CA, the policy cache, and the store facade
//! through [`ProxyInputs`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream::{Rewind, Stream};
use super::{ProxyError, blocked_response, synthetic_response, upstream};
use crate::ProxyInputs;
use crate::http::codec::{self, BodyFraming};
use crate::http::{Request, Scheme, Version};
use crate::policy::{self, Decision};
use crate::store::{Awaited, ResponseVerdict, Verdict};

type Client = BufReader<Stream>;

enum LoopAction {
	KeepAlive,
	Close,
}

enum ReviewOutcome {
	Forward(Request, bool),
	Blocked(Request),
}

pub struct ConnectionHandler {
	pi: Arc<ProxyInputs>,
	shutdown: CancellationToken,
}

impl ConnectionHandler {
	pub fn new(pi: Arc<ProxyInputs>, shutdown: CancellationToken) -> Self {
		Self { pi, shutdown }
	}

	/// Drives one client connection to completion. Never panics across the
	/// task boundary; every outcome lands in a structured log record.
	pub async fn run(self, stream: TcpStream, peer: SocketAddr) {
		debug!(%peer, "connection opened");
		match self.handle(stream, peer).await {
			Ok(()) | Err(ProxyError::Cancelled) => debug!(%peer, "connection closed"),
			Err(e) => warn!(%peer, "connection terminated: {e}"),
		}
	}

	async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
		let mut client: Client = BufReader::new(Stream::Tcp(stream));
		let first = match self.read_request(&mut client).await {
			Ok(Some(req)) => req,
			Ok(None) => return Ok(()),
			Err(e) => return self.fail(&mut client, e).await,
		};

		if first.method.eq_ignore_ascii_case("CONNECT") {
			let tunnel = (first.host.clone(), first.port);
			let mut client = self.establish_tunnel(client, &first).await?;
			self.serve(&mut client, Some(&tunnel), peer, None).await
		} else {
			self.serve(&mut client, None, peer, Some(first)).await
		}
	}

	/// Serial request/response loop over one (possibly impersonated) client
	/// stream. Strict FIFO; pipelined bytes wait in the read buffer.
	async fn serve(
		&self,
		client: &mut Client,
		tunnel: Option<&(String, u16)>,
		peer: SocketAddr,
		pending: Option<Request>,
	) -> Result<(), ProxyError> {
		let result = self.serve_loop(client, tunnel, peer, pending).await;
		// Close cleanly so TLS peers see close_notify, not a truncation.
		let _ = client.shutdown().await;
		result
	}

	async fn serve_loop(
		&self,
		client: &mut Client,
		tunnel: Option<&(String, u16)>,
		peer: SocketAddr,
		mut pending: Option<Request>,
	) -> Result<(), ProxyError> {
		loop {
			let req = match pending.take() {
				Some(req) => req,
				None => match self.read_request(client).await {
					Ok(Some(req)) => req,
					Ok(None) => return Ok(()),
					Err(e) => return self.fail(client, e).await,
				},
			};
			match self.exchange(client, req, tunnel, peer).await {
				Ok(LoopAction::KeepAlive) if !self.shutdown.is_cancelled() => continue,
				Ok(_) => return Ok(()),
				Err(e) => return self.fail(client, e).await,
			}
		}
	}

	/// Reads the next request off the client, treating shutdown and a clean
	/// close identically: no more work on this connection.
	async fn read_request(&self, client: &mut Client) -> Result<Option<Request>, ProxyError> {
		tokio::select! {
			res = codec::decode_request(client, &self.pi.cfg.limits) => match res {
				Ok(req) => Ok(Some(req)),
				Err(codec::Error::Closed) => Ok(None),
				Err(e) => Err(ProxyError::from_decode(e)),
			},
			_ = self.shutdown.cancelled() => Ok(None),
		}
	}

	/// Answers the CONNECT, mints a leaf for the target, and replaces the
	/// plaintext stream with the impersonated TLS session. Handshake
	/// failures close the socket without a response body.
	async fn establish_tunnel(
		&self,
		mut client: Client,
		connect: &Request,
	) -> Result<Client, ProxyError> {
		client
			.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
			.await?;
		client.flush().await?;

		let minted = self.pi.ca.cert_for(&connect.host).await?;

		// The client may already have pipelined its ClientHello behind the
		// CONNECT head; hand those buffered bytes to the handshake.
		let buffered = Bytes::copy_from_slice(client.buffer());
		let Stream::Tcp(tcp) = client.into_inner() else {
			return Err(ProxyError::Internal("CONNECT inside a tunnel".to_string()));
		};
		let tls = TlsAcceptor::from(minted.server_config.clone())
			.accept(Rewind::new(buffered, tcp))
			.await
			.map_err(ProxyError::Tls)?;
		debug!(host = %connect.host, "impersonated tls established");
		Ok(BufReader::new(Stream::Tls(Box::new(tls))))
	}

	async fn exchange(
		&self,
		client: &mut Client,
		mut req: Request,
		tunnel: Option<&(String, u16)>,
		peer: SocketAddr,
	) -> Result<LoopAction, ProxyError> {
		req.client_addr = Some(peer);
		match tunnel {
			Some((host, port)) => {
				req.scheme = Scheme::Https;
				req.host = host.clone();
				req.port = *port;
			},
			None => {
				if req.host.is_empty() {
					let authority = req.headers.get_str("host").map(str::to_string).ok_or_else(|| {
						ProxyError::MalformedRequest(codec::Error::MalformedRequest(
							"no Host header and no absolute request target".to_string(),
						))
					})?;
					let (host, port) =
						codec::split_host_port(&authority, req.scheme.default_port())
							.map_err(ProxyError::MalformedRequest)?;
					req.host = host;
					req.port = port;
				}
			},
		}
		let client_keep_alive = match req.version {
			Version::Http11 => !req.headers.connection_close(),
			Version::Http10 => req.headers.connection_keep_alive(),
		};
		info!(
			id = req.id,
			method = %req.method,
			scheme = %req.scheme,
			host = %req.host,
			path = %req.path,
			"request"
		);

		let (mode, lists) = match self.pi.policy.read(self.pi.store.as_ref()).await {
			Ok(snapshot) => snapshot,
			Err(e) => {
				// Fail closed: no policy, no forwarding.
				warn!(id = req.id, "store unreachable, blocking: {e}");
				return self.respond_blocked(client, &req).await;
			},
		};
		let (req, reviewed) = match policy::evaluate(&req, mode, &lists) {
			Decision::Block => return self.respond_blocked(client, &req).await,
			Decision::Allow => (req, false),
			Decision::Review => match self.review(client, req).await? {
				ReviewOutcome::Forward(req, reviewed) => (req, reviewed),
				ReviewOutcome::Blocked(req) => return self.respond_blocked(client, &req).await,
			},
		};

		self.forward(client, &req, reviewed, client_keep_alive).await
	}

	/// The review rendezvous: publish, then block until a verdict, the
	/// timeout, shutdown, or the client hanging up. The handler performs no
	/// client reads while parked here.
	async fn review(&self, client: &mut Client, req: Request) -> Result<ReviewOutcome, ProxyError> {
		let store = self.pi.store.clone();
		let id = store
			.publish_pending(&req)
			.await
			.map_err(ProxyError::StoreUnavailable)?;
		info!(id, host = %req.host, "held for review");

		let outcome = {
			let tcp = client.get_ref().tcp();
			tokio::select! {
				out = store.await_verdict(id, self.pi.cfg.verdict_timeout) => {
					Some(out.map_err(ProxyError::StoreUnavailable)?)
				},
				_ = client_closed(tcp) => None,
				_ = self.shutdown.cancelled() => None,
			}
		};
		match outcome {
			Some(Awaited::Decided(Verdict::Allow)) => Ok(ReviewOutcome::Forward(req, true)),
			Some(Awaited::Decided(Verdict::AllowEdited { request })) => {
				let mut edited = *request;
				edited.id = id;
				edited.client_addr = req.client_addr;
				edited.sync_content_length();
				info!(id, "forwarding edited request");
				Ok(ReviewOutcome::Forward(edited, true))
			},
			Some(Awaited::Decided(Verdict::Block)) => Ok(ReviewOutcome::Blocked(req)),
			Some(Awaited::TimedOut) => {
				info!(id, "verdict timed out, blocking");
				Ok(ReviewOutcome::Blocked(req))
			},
			Some(Awaited::Cancelled) => Err(ProxyError::Cancelled),
			None => {
				// Client closed (or shutdown) mid-review: tell the store so
				// the UI drops the item, and never forward.
				let _ = store.cancel(id).await;
				debug!(id, "review abandoned");
				Err(ProxyError::Cancelled)
			},
		}
	}

	async fn forward(
		&self,
		client: &mut Client,
		req: &Request,
		reviewed: bool,
		client_keep_alive: bool,
	) -> Result<LoopAction, ProxyError> {
		// Fresh upstream connection per request; no pooling.
		let mut up = upstream::connect(
			req.scheme,
			&req.host,
			req.port,
			self.pi.cfg.upstream_connect_timeout,
		)
		.await?;

		let mut outbound = req.clone();
		if !outbound.headers.contains("host") {
			outbound.headers.append("Host", host_header(req));
		}
		codec::encode_request(&mut up, &outbound)
			.await
			.map_err(|e| match e {
				codec::Error::Io(io) => ProxyError::UpstreamUnreachable(io),
				other => ProxyError::Internal(other.to_string()),
			})?;

		let limits = self.pi.cfg.limits;
		let (mut resp, framing) = codec::decode_response_head(&mut up, &limits, req.id, &req.method)
			.await
			.map_err(ProxyError::from_upstream_decode)?;
		debug!(id = req.id, status = resp.status, "response head");

		if reviewed && self.pi.cfg.review_responses {
			match codec::read_body(&mut up, framing, &limits).await {
				Ok((body, trailers)) => {
					resp.body = body;
					for t in trailers {
						resp.headers.push(t);
					}
				},
				// A response too large to show a reviewer is not relayed.
				Err(codec::Error::PayloadTooLarge) => {
					warn!(id = req.id, "response exceeds review cap");
					let synthetic =
						synthetic_response(req.id, req.version, 502, "Response too large for review.\n");
					codec::encode_response(client, &synthetic)
						.await
						.map_err(client_write_err)?;
					return Ok(LoopAction::Close);
				},
				Err(e) => return Err(ProxyError::from_upstream_decode(e)),
			}
			self
				.pi
				.store
				.publish_response(req.id, &resp)
				.await
				.map_err(ProxyError::StoreUnavailable)?;

			let outcome = {
				let tcp = client.get_ref().tcp();
				tokio::select! {
					out = self.pi.store.await_response_verdict(req.id, self.pi.cfg.verdict_timeout) => {
						Some(out.map_err(ProxyError::StoreUnavailable)?)
					},
					_ = client_closed(tcp) => None,
					_ = self.shutdown.cancelled() => None,
				}
			};
			match outcome {
				Some(Awaited::Decided(ResponseVerdict::Allow)) => {},
				Some(Awaited::Decided(ResponseVerdict::AllowEdited { response })) => {
					resp = *response;
					resp.id = req.id;
					resp.sync_content_length();
					info!(id = req.id, "relaying edited response");
				},
				Some(Awaited::Decided(ResponseVerdict::Block)) | Some(Awaited::TimedOut) => {
					return self.respond_blocked(client, req).await;
				},
				Some(Awaited::Cancelled) | None => return Err(ProxyError::Cancelled),
			}
			codec::encode_response(client, &resp)
				.await
				.map_err(client_write_err)?;
		} else {
			// Relay in lockstep: the header block up front, then the body as
			// it arrives, so slow readers throttle both sides naturally.
			codec::encode_response_head(client, &resp)
				.await
				.map_err(client_write_err)?;
			codec::copy_body(&mut up, client, framing, &limits)
				.await
				.map_err(|e| match e {
					codec::Error::Io(io) => ProxyError::Io(io),
					// The head is already on the wire; no synthetic status
					// can follow, only a close.
					other => ProxyError::Io(std::io::Error::other(other)),
				})?;
		}

		let keep = client_keep_alive
			&& framing != BodyFraming::Eof
			&& !resp.headers.connection_close()
			&& resp.status != 101;
		Ok(if keep {
			LoopAction::KeepAlive
		} else {
			LoopAction::Close
		})
	}

	async fn respond_blocked(
		&self,
		client: &mut Client,
		req: &Request,
	) -> Result<LoopAction, ProxyError> {
		info!(id = req.id, host = %req.host, "blocked");
		let resp = blocked_response(req.id, req.version);
		codec::encode_response(client, &resp)
			.await
			.map_err(client_write_err)?;
		Ok(LoopAction::Close)
	}

	/// Answers errors that still have a client-facing status, then
	/// propagates. TLS and mid-stream failures just close.
	async fn fail(&self, client: &mut Client, e: ProxyError) -> Result<(), ProxyError> {
		if let Some(status) = e.status() {
			let body = format!("{}\n", ProxyError::reason(status));
			let resp = synthetic_response(0, Version::Http11, status, &body);
			let _ = codec::encode_response(client, &resp).await;
		}
		match e {
			ProxyError::Cancelled => Ok(()),
			other => Err(other),
		}
	}
}

fn host_header(req: &Request) -> String {
	if req.port == req.scheme.default_port() {
		req.host.clone()
	} else {
		format!("{}:{}", req.host, req.port)
	}
}

fn client_write_err(e: codec::Error) -> ProxyError {
	match e {
		codec::Error::Io(io) => ProxyError::Io(io),
		other => ProxyError::Internal(other.to_string()),
	}
}

/// Resolves when the peer half-closes or resets the raw socket. Data
/// arriving (pipelined bytes, TLS records) keeps the probe parked.
async fn client_closed(tcp: &TcpStream) {
	let mut buf = [0u8; 1];
	loop {
		match tcp.peek(&mut buf).await {
			Ok(0) => return,
			Ok(_) => tokio::time::sleep(Duration::from_millis(200)).await,
			Err(_) => return,
		}
	}
}
