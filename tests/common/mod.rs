//! Shared fixtures: a proxy spawned on an ephemeral port, byte-exact mock
//! origins, and a reviewer driving the in-memory store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use watchgate::config::Config;
use watchgate::http::Request;
use watchgate::http::codec::{self, Limits};
use watchgate::policy::{Blocklist, PolicyCache, PolicyMode};
use watchgate::store::memory::MemoryStore;
use watchgate::tls::ca::CertAuthority;
use watchgate::{ProxyInputs, app};

pub struct TestProxy {
	pub addr: SocketAddr,
	pub store: Arc<MemoryStore>,
	pub ca: Arc<CertAuthority>,
	shutdown: CancellationToken,
	_ca_dir: TempDir,
}

impl Drop for TestProxy {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

impl TestProxy {
	pub async fn spawn(mutate: impl FnOnce(&mut Config)) -> Self {
		let ca_dir = TempDir::new().unwrap();
		let mut cfg = Config::default();
		cfg.ca_cert_path = ca_dir.path().join("ca.crt");
		cfg.ca_key_path = ca_dir.path().join("ca.key");
		mutate(&mut cfg);

		let ca = Arc::new(
			CertAuthority::load_or_create(&cfg.ca_cert_path, &cfg.ca_key_path, cfg.cert_cache_capacity)
				.unwrap(),
		);
		let store = Arc::new(MemoryStore::new());
		let pi = Arc::new(ProxyInputs {
			cfg: Arc::new(cfg),
			ca: ca.clone(),
			store: store.clone(),
			policy: PolicyCache::new(),
		});

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let shutdown = CancellationToken::new();
		tokio::spawn(app::serve(pi, listener, shutdown.child_token()));

		Self {
			addr,
			store,
			ca,
			shutdown,
			_ca_dir: ca_dir,
		}
	}

	pub fn set_filter_mode(&self, lists: Blocklist) {
		self.store.set_mode(PolicyMode::Filter);
		self.store.set_blocklists(lists);
	}

	pub async fn connect(&self) -> TcpStream {
		TcpStream::connect(self.addr).await.unwrap()
	}

	/// Polls the pending list until one id shows up.
	pub async fn wait_pending(&self) -> u64 {
		wait_pending(&self.store).await
	}
}

/// Polls the store until an intercept item becomes pending.
pub async fn wait_pending(store: &MemoryStore) -> u64 {
	for _ in 0..200 {
		if let Some(&id) = store.pending_ids().first() {
			return id;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("no intercept item became pending");
}

/// A mock origin serving scripted raw responses, one connection at a time.
/// Received requests (parsed) are handed back over a channel.
pub struct MockOrigin {
	pub addr: SocketAddr,
	pub requests: mpsc::UnboundedReceiver<Request>,
}

impl MockOrigin {
	/// Serves `response` bytes to every connection after reading one
	/// request, forever.
	pub async fn spawn(response: &'static [u8]) -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (tx, rx) = mpsc::unbounded_channel();
		tokio::spawn(async move {
			loop {
				let Ok((stream, _)) = listener.accept().await else {
					return;
				};
				let mut reader = BufReader::new(stream);
				let Ok(req) = codec::decode_request(&mut reader, &Limits::default()).await else {
					continue;
				};
				let _ = tx.send(req);
				let mut stream = reader.into_inner();
				let _ = stream.write_all(response).await;
				let _ = stream.flush().await;
			}
		});
		Self { addr, requests: rx }
	}

	pub fn host_port(&self) -> (String, u16) {
		(self.addr.ip().to_string(), self.addr.port())
	}
}

/// Sends raw bytes through the proxy and reads until EOF.
pub async fn roundtrip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
	let mut stream = TcpStream::connect(addr).await.unwrap();
	stream.write_all(request).await.unwrap();
	stream.flush().await.unwrap();
	let mut out = Vec::new();
	stream.read_to_end(&mut out).await.unwrap();
	out
}

/// Reads exactly `n` bytes.
pub async fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
	let mut buf = vec![0u8; n];
	stream.read_exact(&mut buf).await.unwrap();
	buf
}

pub fn status_line(raw: &[u8]) -> String {
	let text = String::from_utf8_lossy(raw);
	text.lines().next().unwrap_or_default().to_string()
}

/// A client TLS config trusting only the proxy's root: the handshake itself
/// asserts the minted chain and SAN coverage.
pub fn trusting_tls_config(ca: &CertAuthority) -> Arc<rustls::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_pemfile::certs(&mut ca.root_cert_pem().as_bytes()) {
		roots.add(cert.unwrap()).unwrap();
	}
	Arc::new(
		rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth(),
	)
}

/// Issues a CONNECT through the proxy and completes the impersonated
/// handshake for `host`.
pub async fn open_tunnel(
	proxy: &TestProxy,
	host: &str,
	port: u16,
) -> tokio_rustls::client::TlsStream<TcpStream> {
	let mut stream = proxy.connect().await;
	stream
		.write_all(format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n").as_bytes())
		.await
		.unwrap();
	let established = read_exact(&mut stream, b"HTTP/1.1 200 Connection Established\r\n\r\n".len()).await;
	assert!(
		established.starts_with(b"HTTP/1.1 200"),
		"unexpected CONNECT reply: {}",
		String::from_utf8_lossy(&established)
	);

	let server_name = rustls_pki_types::ServerName::try_from(host.to_string()).unwrap();
	tokio_rustls::TlsConnector::from(trusting_tls_config(&proxy.ca))
		.connect(server_name, stream)
		.await
		.unwrap()
}
