pub mod app;
pub mod config;
pub mod http;
pub mod policy;
pub mod proxy;
pub mod signal;
pub mod store;
pub mod tls;

use std::sync::Arc;

pub use config::Config;

/// Dependencies injected into every connection handler. Constructed once at
/// startup; handlers share them behind an `Arc`.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub ca: Arc<tls::ca::CertAuthority>,
	pub store: Arc<dyn store::Store>,
	pub policy: policy::PolicyCache,
}
