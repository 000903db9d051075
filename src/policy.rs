//! Declarative block policy: domain patterns and keyword substrings.
//!
//! Evaluation is pure; the handler feeds it the mode and a blocklist
//! snapshot read through the store facade.

use serde::{Deserialize, Serialize};

use crate::http::Request;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
	/// Everything passing the blocklist is held for human review.
	#[default]
	Intercept,
	/// Blocklist only; no human in the loop.
	Filter,
}

impl std::str::FromStr for PolicyMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"intercept" => Ok(PolicyMode::Intercept),
			"filter" => Ok(PolicyMode::Filter),
			other => Err(format!("unknown policy mode {other:?}")),
		}
	}
}

/// A consistent snapshot of the block rules. Pattern order is preserved;
/// the first match wins, though the outcome never depends on order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Blocklist {
	pub domains: Vec<String>,
	pub keywords: Vec<String>,
}

impl Blocklist {
	pub fn is_empty(&self) -> bool {
		self.domains.is_empty() && self.keywords.is_empty()
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
	Allow,
	Block,
	Review,
}

/// Evaluates a request against the blocklists. Pure: same inputs, same
/// output.
pub fn evaluate(req: &Request, mode: PolicyMode, lists: &Blocklist) -> Decision {
	if let Some(pattern) = lists
		.domains
		.iter()
		.find(|p| domain_matches(p, &req.host))
	{
		tracing::debug!(host = %req.host, pattern = %pattern, "blocked by domain");
		return Decision::Block;
	}
	if let Some(keyword) = lists.keywords.iter().find(|k| request_contains(req, k)) {
		tracing::debug!(host = %req.host, keyword = %keyword, "blocked by keyword");
		return Decision::Block;
	}
	match mode {
		PolicyMode::Filter => Decision::Allow,
		PolicyMode::Intercept => Decision::Review,
	}
}

/// `*.example.com` matches strict subdomains only; a bare pattern matches
/// itself only. Comparison is case-insensitive. IP literals only ever match
/// literally.
fn domain_matches(pattern: &str, host: &str) -> bool {
	if pattern.is_empty() || host.is_empty() {
		return false;
	}
	if host.parse::<std::net::IpAddr>().is_ok() {
		return pattern.eq_ignore_ascii_case(host);
	}
	match pattern.strip_prefix("*.") {
		Some(parent) => {
			let host = host.to_ascii_lowercase();
			let parent = parent.to_ascii_lowercase();
			host.len() > parent.len() + 1
				&& host.ends_with(&parent)
				&& host.as_bytes()[host.len() - parent.len() - 1] == b'.'
		},
		None => pattern.eq_ignore_ascii_case(host),
	}
}

/// Case-insensitive substring scan over path, header values, and body,
/// bytewise over the UTF-8 keyword.
fn request_contains(req: &Request, keyword: &str) -> bool {
	if keyword.is_empty() {
		return false;
	}
	if contains_ci(req.path.as_bytes(), keyword.as_bytes()) {
		return true;
	}
	if req
		.headers
		.iter()
		.any(|e| contains_ci(&e.value, keyword.as_bytes()))
	{
		return true;
	}
	contains_ci(&req.body, keyword.as_bytes())
}

fn contains_ci(haystack: &[u8], needle: &[u8]) -> bool {
	if needle.is_empty() || haystack.len() < needle.len() {
		return false;
	}
	haystack
		.windows(needle.len())
		.any(|w| w.eq_ignore_ascii_case(needle))
}

/// The policy view the handler reads per request, with a bounded fallback
/// window when the store is unreachable: a filter-mode snapshot may serve
/// for up to 30 seconds, after which the proxy fails closed.
pub struct PolicyCache {
	last: std::sync::Mutex<Option<Snapshot>>,
}

struct Snapshot {
	mode: PolicyMode,
	lists: Blocklist,
	at: std::time::Instant,
}

const SNAPSHOT_MAX_AGE: std::time::Duration = std::time::Duration::from_secs(30);

impl Default for PolicyCache {
	fn default() -> Self {
		Self::new()
	}
}

impl PolicyCache {
	pub fn new() -> Self {
		Self {
			last: std::sync::Mutex::new(None),
		}
	}

	pub async fn read(
		&self,
		store: &dyn crate::store::Store,
	) -> Result<(PolicyMode, Blocklist), crate::store::Error> {
		let mode = store.read_policy_mode().await;
		let lists = store.read_blocklists().await;
		match (mode, lists) {
			(Ok(mode), Ok(lists)) => {
				*self.last.lock().expect("policy cache lock poisoned") = Some(Snapshot {
					mode,
					lists: lists.clone(),
					at: std::time::Instant::now(),
				});
				Ok((mode, lists))
			},
			(mode, lists) => {
				let err = mode.err().or(lists.err()).expect("at least one side failed");
				let last = self.last.lock().expect("policy cache lock poisoned");
				match last.as_ref() {
					// Intercept mode always fails closed: a stale snapshot
					// cannot stand in for a human verdict.
					Some(snap)
						if snap.mode == PolicyMode::Filter && snap.at.elapsed() <= SNAPSHOT_MAX_AGE =>
					{
						tracing::warn!("store unreachable, serving cached filter policy: {err}");
						Ok((snap.mode, snap.lists.clone()))
					},
					_ => Err(err),
				}
			},
		}
	}
}
