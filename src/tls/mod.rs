//! rustls plumbing shared by the impersonation (server) and upstream
//! (client) sides of a connection.

pub mod ca;

use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::warn;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

static SYSTEM_ROOTS: Lazy<Arc<rustls::RootCertStore>> = Lazy::new(|| {
	let mut roots = rustls::RootCertStore::empty();
	let result = rustls_native_certs::load_native_certs();
	for err in &result.errors {
		warn!("system trust store: {err}");
	}
	let (added, ignored) = roots.add_parsable_certificates(result.certs);
	tracing::debug!(added, ignored, "loaded system trust anchors");
	Arc::new(roots)
});

/// Client config verifying against the system trust store. Used for every
/// upstream TLS session; the local MITM root is never part of this set.
pub static UPSTREAM_TLS: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
	let mut cfg = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)
		.expect("protocol versions are statically valid")
		.with_root_certificates(SYSTEM_ROOTS.clone())
		.with_no_client_auth();
	cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
	Arc::new(cfg)
});

/// Server config presenting one minted leaf. ALPN is pinned to HTTP/1.1;
/// the data plane does not speak h2.
pub fn impersonation_config(
	cert: CertificateDer<'static>,
	key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, rustls::Error> {
	let mut cfg = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)?
		.with_no_client_auth()
		.with_single_cert(vec![cert], key)?;
	cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
	Ok(Arc::new(cfg))
}

/// Opens a client TLS session over `tcp` with SNI and hostname verification
/// for `host`.
pub async fn connect_upstream(host: &str, tcp: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
	let server_name = ServerName::try_from(host.to_string())
		.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
	TlsConnector::from(UPSTREAM_TLS.clone())
		.connect(server_name, tcp)
		.await
}
