use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{self, EnvFilter};
use watchgate::policy::PolicyCache;
use watchgate::store::Store;
use watchgate::store::memory::MemoryStore;
use watchgate::tls::ca::CertAuthority;
use watchgate::{ProxyInputs, app, config, signal};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let cfg = Arc::new(config::load(args.file.as_deref())?);

	let ca = Arc::new(CertAuthority::load_or_create(
		&cfg.ca_cert_path,
		&cfg.ca_key_path,
		cfg.cert_cache_capacity,
	)?);
	info!(
		cert = %cfg.ca_cert_path.display(),
		"root CA ready; install it into the browser trust store"
	);

	let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
	let pi = Arc::new(ProxyInputs {
		cfg,
		ca,
		store,
		policy: PolicyCache::new(),
	});

	let token = CancellationToken::new();
	let server = tokio::spawn(app::run(pi, token.child_token()));

	signal::shutdown_requested().await;
	token.cancel();
	server.await??;
	Ok(())
}
