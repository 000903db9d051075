use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use super::*;

fn paths(dir: &TempDir) -> (PathBuf, PathBuf) {
	(dir.path().join("ca.crt"), dir.path().join("ca.key"))
}

fn new_ca(dir: &TempDir, capacity: usize) -> CertAuthority {
	let (cert, key) = paths(dir);
	CertAuthority::load_or_create(&cert, &key, capacity).unwrap()
}

fn dns_sans(minted: &MintedCert) -> Vec<String> {
	let (_, cert) = X509Certificate::from_der(minted.cert_der.as_ref()).unwrap();
	cert
		.subject_alternative_name()
		.unwrap()
		.map(|san| {
			san
				.value
				.general_names
				.iter()
				.filter_map(|n| match n {
					GeneralName::DNSName(s) => Some(s.to_string()),
					_ => None,
				})
				.collect()
		})
		.unwrap_or_default()
}

#[test]
fn first_run_creates_root_with_private_key_mode() {
	let dir = TempDir::new().unwrap();
	let (cert_path, key_path) = paths(&dir);
	let _ca = new_ca(&dir, 8);
	assert!(cert_path.exists());
	assert!(key_path.exists());

	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		let mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
		assert_eq!(mode, 0o600);
	}
}

#[test]
fn reload_returns_the_same_root() {
	let dir = TempDir::new().unwrap();
	let first = new_ca(&dir, 8);
	let second = new_ca(&dir, 8);
	assert_eq!(first.root_cert_pem(), second.root_cert_pem());
}

#[test]
fn missing_key_file_is_a_load_error() {
	let dir = TempDir::new().unwrap();
	let (cert_path, key_path) = paths(&dir);
	drop(new_ca(&dir, 8));
	std::fs::remove_file(&key_path).unwrap();
	let err = CertAuthority::load_or_create(&cert_path, &key_path, 8).unwrap_err();
	assert!(matches!(err, Error::RootLoad(_)));
}

#[test]
fn mismatched_key_is_a_load_error() {
	let dir_a = TempDir::new().unwrap();
	let dir_b = TempDir::new().unwrap();
	drop(new_ca(&dir_a, 8));
	drop(new_ca(&dir_b, 8));
	let (cert_a, key_a) = paths(&dir_a);
	let (_, key_b) = paths(&dir_b);
	std::fs::copy(&key_b, &key_a).unwrap();
	let err = CertAuthority::load_or_create(&cert_a, &key_a, 8).unwrap_err();
	assert!(err.to_string().contains("does not match"));
}

#[tokio::test]
async fn leaf_covers_host_and_wildcard_parent() {
	let dir = TempDir::new().unwrap();
	let ca = new_ca(&dir, 8);
	let minted = ca.cert_for("secure.test").await.unwrap();
	assert_eq!(
		dns_sans(&minted),
		vec!["secure.test".to_string(), "*.test".to_string()]
	);
}

#[tokio::test]
async fn single_label_host_gets_no_wildcard() {
	let dir = TempDir::new().unwrap();
	let ca = new_ca(&dir, 8);
	let minted = ca.cert_for("localhost").await.unwrap();
	assert_eq!(dns_sans(&minted), vec!["localhost".to_string()]);
}

#[tokio::test]
async fn ip_literal_gets_an_ip_san() {
	let dir = TempDir::new().unwrap();
	let ca = new_ca(&dir, 8);
	let minted = ca.cert_for("127.0.0.1").await.unwrap();
	let (_, cert) = X509Certificate::from_der(minted.cert_der.as_ref()).unwrap();
	let san = cert.subject_alternative_name().unwrap().unwrap();
	assert!(san.value.general_names.iter().any(|n| matches!(
		n,
		GeneralName::IPAddress(b) if *b == [127, 0, 0, 1]
	)));
	assert!(dns_sans(&minted).is_empty());
}

#[tokio::test]
async fn leaf_signature_verifies_against_the_root() {
	let dir = TempDir::new().unwrap();
	let ca = new_ca(&dir, 8);
	let minted = ca.cert_for("secure.test").await.unwrap();

	let (_, root_pem) = x509_parser::pem::parse_x509_pem(ca.root_cert_pem().as_bytes()).unwrap();
	let root = root_pem.parse_x509().unwrap();
	let (_, leaf) = X509Certificate::from_der(minted.cert_der.as_ref()).unwrap();
	leaf.verify_signature(Some(root.public_key())).unwrap();
	assert_eq!(leaf.issuer(), root.subject());
}

#[tokio::test]
async fn repeated_lookups_hit_the_cache() {
	let dir = TempDir::new().unwrap();
	let ca = new_ca(&dir, 8);
	let first = ca.cert_for("secure.test").await.unwrap();
	let second = ca.cert_for("secure.test").await.unwrap();
	assert!(Arc::ptr_eq(&first, &second));
	// Hostname normalization shares the entry.
	let third = ca.cert_for("SECURE.test.").await.unwrap();
	assert!(Arc::ptr_eq(&first, &third));
}

#[tokio::test]
async fn concurrent_misses_coalesce() {
	let dir = TempDir::new().unwrap();
	let ca = new_ca(&dir, 8);
	let (a, b) = tokio::join!(ca.cert_for("x.test"), ca.cert_for("x.test"));
	assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
}

#[tokio::test]
async fn cache_evicts_least_recently_used() {
	let dir = TempDir::new().unwrap();
	let ca = new_ca(&dir, 2);
	let a = ca.cert_for("a.test").await.unwrap();
	let _b = ca.cert_for("b.test").await.unwrap();
	let _c = ca.cert_for("c.test").await.unwrap();
	let a_again = ca.cert_for("a.test").await.unwrap();
	assert!(!Arc::ptr_eq(&a, &a_again));
}
