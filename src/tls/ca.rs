//! The local certificate authority: a persistent self-signed root plus
//! per-hostname leaf minting with an LRU cache.
//!
//! The root private key never leaves this module; minted leaf keys only
//! exist inside the per-host rustls `ServerConfig`.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
	Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType,
};
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;
use tracing::info;

const ROOT_COMMON_NAME: &str = "MITM Proxy Root";
const ROOT_VALIDITY_DAYS: i64 = 10 * 365;
const LEAF_VALIDITY_DAYS: i64 = 397;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("root CA load failed: {0}")]
	RootLoad(String),
	#[error("certificate mint failed for {host}: {reason}")]
	Mint { host: String, reason: String },
}

/// A leaf minted for one hostname, with the prebuilt server config the
/// handshake uses.
pub struct MintedCert {
	pub hostname: String,
	pub cert_der: CertificateDer<'static>,
	pub not_after: OffsetDateTime,
	pub server_config: Arc<ServerConfig>,
}

impl MintedCert {
	fn is_valid(&self) -> bool {
		self.not_after > OffsetDateTime::now_utc()
	}
}

type MintCell = Arc<OnceCell<Arc<MintedCert>>>;

pub struct CertAuthority {
	issuer: Issuer<'static, KeyPair>,
	root_cert_pem: String,
	cache: Mutex<LruCache<String, Arc<MintedCert>>>,
	// Coalesces concurrent misses for the same host onto a single mint;
	// distinct hosts mint in parallel.
	inflight: tokio::sync::Mutex<HashMap<String, MintCell>>,
}

impl std::fmt::Debug for CertAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertAuthority").finish_non_exhaustive()
	}
}

impl CertAuthority {
	/// Loads the root from `cert_path`/`key_path`, or mints and persists a
	/// fresh one when neither file exists. One file without the other is a
	/// load error, never a silent regeneration.
	pub fn load_or_create(
		cert_path: &Path,
		key_path: &Path,
		cache_capacity: usize,
	) -> Result<Self, Error> {
		let (cert_pem, key_pem) = if cert_path.exists() || key_path.exists() {
			if !cert_path.exists() || !key_path.exists() {
				return Err(Error::RootLoad(format!(
					"both root files must exist (cert={}, key={})",
					cert_path.display(),
					key_path.display()
				)));
			}
			validate_key_file(key_path)?;
			let cert = fs::read_to_string(cert_path)
				.map_err(|e| Error::RootLoad(format!("read {}: {e}", cert_path.display())))?;
			let key = fs::read_to_string(key_path)
				.map_err(|e| Error::RootLoad(format!("read {}: {e}", key_path.display())))?;
			(cert, key)
		} else {
			let (cert, key) = generate_root()?;
			persist_root(cert_path, key_path, &cert, &key)?;
			info!(cert = %cert_path.display(), key = %key_path.display(), "generated root CA");
			(cert, key)
		};

		let key_pair = KeyPair::from_pem(&key_pem)
			.map_err(|e| Error::RootLoad(format!("parse root key: {e}")))?;
		verify_key_matches_cert(&cert_pem, &key_pair)?;
		let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
			.map_err(|e| Error::RootLoad(format!("parse root certificate: {e}")))?;

		let capacity =
			NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(1024).expect("nonzero"));
		Ok(Self {
			issuer,
			root_cert_pem: cert_pem,
			cache: Mutex::new(LruCache::new(capacity)),
			inflight: tokio::sync::Mutex::new(HashMap::new()),
		})
	}

	/// The root certificate PEM, for out-of-band browser installation.
	pub fn root_cert_pem(&self) -> &str {
		&self.root_cert_pem
	}

	/// Returns the cached leaf for `hostname`, minting one on a miss.
	pub async fn cert_for(&self, hostname: &str) -> Result<Arc<MintedCert>, Error> {
		let host = hostname.trim_end_matches('.').to_ascii_lowercase();
		if let Some(hit) = self.cache_get(&host) {
			return Ok(hit);
		}

		let cell: MintCell = {
			let mut inflight = self.inflight.lock().await;
			inflight.entry(host.clone()).or_default().clone()
		};
		let minted = cell
			.get_or_try_init(|| async {
				let minted = Arc::new(self.mint(&host)?);
				self
					.cache
					.lock()
					.expect("cert cache lock poisoned")
					.put(host.clone(), minted.clone());
				Ok::<_, Error>(minted)
			})
			.await?
			.clone();
		self.inflight.lock().await.remove(&host);
		Ok(minted)
	}

	fn cache_get(&self, host: &str) -> Option<Arc<MintedCert>> {
		let mut cache = self.cache.lock().expect("cert cache lock poisoned");
		match cache.get(host) {
			Some(minted) if minted.is_valid() => Some(minted.clone()),
			Some(_) => {
				cache.pop(host);
				None
			},
			None => None,
		}
	}

	fn mint(&self, host: &str) -> Result<MintedCert, Error> {
		let err = |reason: String| Error::Mint {
			host: host.to_string(),
			reason,
		};

		let mut params = match host.parse::<IpAddr>() {
			Ok(ip) => {
				let mut params =
					CertificateParams::new(Vec::new()).map_err(|e| err(e.to_string()))?;
				params.subject_alt_names.push(SanType::IpAddress(ip));
				params
			},
			Err(_) => {
				let mut sans = vec![host.to_string()];
				// `a.b.c` also covers `*.b.c`; single-label hosts get no
				// wildcard parent.
				if let Some((_, parent)) = host.split_once('.') {
					if !parent.is_empty() {
						sans.push(format!("*.{parent}"));
					}
				}
				CertificateParams::new(sans).map_err(|e| err(e.to_string()))?
			},
		};
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, host);
		params.distinguished_name = dn;
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		params.key_usages = vec![
			KeyUsagePurpose::DigitalSignature,
			KeyUsagePurpose::KeyEncipherment,
		];
		let now = OffsetDateTime::now_utc();
		params.not_before = now - Duration::hours(1);
		params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
		let not_after = params.not_after;

		let key_pair =
			KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| err(e.to_string()))?;
		let cert = params
			.signed_by(&key_pair, &self.issuer)
			.map_err(|e| err(e.to_string()))?;
		let cert_der = cert.der().clone();
		let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

		let server_config = crate::tls::impersonation_config(cert_der.clone(), key_der.into())
			.map_err(|e| err(e.to_string()))?;
		Ok(MintedCert {
			hostname: host.to_string(),
			cert_der,
			not_after,
			server_config,
		})
	}
}

fn generate_root() -> Result<(String, String), Error> {
	let mut params = CertificateParams::default();
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, ROOT_COMMON_NAME);
	params.distinguished_name = dn;
	let now = OffsetDateTime::now_utc();
	params.not_before = now - Duration::hours(1);
	params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

	let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
		.map_err(|e| Error::RootLoad(format!("generate root key: {e}")))?;
	let cert = params
		.self_signed(&key_pair)
		.map_err(|e| Error::RootLoad(format!("self-sign root: {e}")))?;
	Ok((cert.pem(), key_pair.serialize_pem()))
}

fn persist_root(
	cert_path: &Path,
	key_path: &Path,
	cert_pem: &str,
	key_pem: &str,
) -> Result<(), Error> {
	if let Some(parent) = key_path.parent() {
		fs::create_dir_all(parent)
			.map_err(|e| Error::RootLoad(format!("create {}: {e}", parent.display())))?;
	}
	if let Some(parent) = cert_path.parent() {
		fs::create_dir_all(parent)
			.map_err(|e| Error::RootLoad(format!("create {}: {e}", parent.display())))?;
	}
	write_atomic(key_path, key_pem.as_bytes(), 0o600)?;
	if let Err(e) = write_atomic(cert_path, cert_pem.as_bytes(), 0o644) {
		// Do not leave a key without its certificate behind.
		let _ = fs::remove_file(key_path);
		return Err(e);
	}
	Ok(())
}

fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), Error> {
	use std::io::Write;

	let parent = path
		.parent()
		.ok_or_else(|| Error::RootLoad(format!("{} has no parent", path.display())))?;
	let name = path.file_name().unwrap_or_default().to_string_lossy();
	let tmp = parent.join(format!(".{name}.tmp.{}", std::process::id()));

	let mut file = open_with_mode(&tmp, mode)
		.map_err(|e| Error::RootLoad(format!("create {}: {e}", tmp.display())))?;
	file
		.write_all(contents)
		.and_then(|()| file.sync_all())
		.map_err(|e| Error::RootLoad(format!("write {}: {e}", tmp.display())))?;
	drop(file);
	fs::rename(&tmp, path).map_err(|e| {
		let _ = fs::remove_file(&tmp);
		Error::RootLoad(format!("rename {} -> {}: {e}", tmp.display(), path.display()))
	})
}

#[cfg(unix)]
fn open_with_mode(path: &Path, mode: u32) -> std::io::Result<fs::File> {
	use std::os::unix::fs::OpenOptionsExt;
	fs::OpenOptions::new()
		.write(true)
		.create_new(true)
		.mode(mode)
		.open(path)
}

#[cfg(not(unix))]
fn open_with_mode(path: &Path, _mode: u32) -> std::io::Result<fs::File> {
	fs::OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn validate_key_file(path: &Path) -> Result<(), Error> {
	use std::os::unix::fs::PermissionsExt;

	let metadata = fs::symlink_metadata(path)
		.map_err(|e| Error::RootLoad(format!("stat {}: {e}", path.display())))?;
	if !metadata.is_file() {
		return Err(Error::RootLoad(format!(
			"root key {} is not a regular file",
			path.display()
		)));
	}
	let mode = metadata.permissions().mode() & 0o777;
	if mode & 0o077 != 0 {
		return Err(Error::RootLoad(format!(
			"root key {} must not be group/world accessible (mode {mode:o})",
			path.display()
		)));
	}
	Ok(())
}

#[cfg(not(unix))]
fn validate_key_file(_path: &Path) -> Result<(), Error> {
	Ok(())
}

/// A swapped key or certificate file must fail loudly, not mint garbage.
fn verify_key_matches_cert(cert_pem: &str, key_pair: &KeyPair) -> Result<(), Error> {
	let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
		.map_err(|e| Error::RootLoad(format!("parse root certificate PEM: {e}")))?;
	let cert = pem
		.parse_x509()
		.map_err(|e| Error::RootLoad(format!("parse root certificate: {e}")))?;
	let (_, spki_pem) = x509_parser::pem::parse_x509_pem(key_pair.public_key_pem().as_bytes())
		.map_err(|e| Error::RootLoad(format!("encode root key public key: {e}")))?;
	let spki = spki_pem.contents;
	if cert.public_key().raw != spki.as_slice() {
		return Err(Error::RootLoad(
			"root key does not match root certificate".to_string(),
		));
	}
	Ok(())
}

#[cfg(test)]
#[path = "ca_tests.rs"]
mod tests;
