pub mod handler;
pub mod stream;
pub mod upstream;

pub use handler::ConnectionHandler;

use bytes::Bytes;
use chrono::Utc;

use crate::http::{HeaderMap, Response, Version, codec};
use crate::store;
use crate::tls::ca;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("malformed request: {0}")]
	MalformedRequest(codec::Error),
	#[error("ambiguous message length")]
	AmbiguousLength,
	#[error("payload too large")]
	PayloadTooLarge,
	#[error("tls handshake failed: {0}")]
	Tls(std::io::Error),
	#[error("upstream unreachable: {0}")]
	UpstreamUnreachable(std::io::Error),
	#[error("upstream tls failure: {0}")]
	UpstreamTls(std::io::Error),
	#[error("upstream timed out")]
	UpstreamTimeout,
	#[error("upstream sent a malformed response: {0}")]
	UpstreamProtocol(codec::Error),
	#[error("store unavailable: {0}")]
	StoreUnavailable(store::Error),
	#[error("certificate authority: {0}")]
	Ca(#[from] ca::Error),
	/// Not an error: the client went away and the handler wound down cleanly.
	#[error("cancelled")]
	Cancelled,
	#[error("internal: {0}")]
	Internal(String),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
}

impl ProxyError {
	pub fn from_decode(e: codec::Error) -> Self {
		match e {
			codec::Error::AmbiguousLength => ProxyError::AmbiguousLength,
			codec::Error::PayloadTooLarge => ProxyError::PayloadTooLarge,
			codec::Error::Io(e) => ProxyError::Io(e),
			other => ProxyError::MalformedRequest(other),
		}
	}

	pub fn from_upstream_decode(e: codec::Error) -> Self {
		match e {
			codec::Error::Io(e) => ProxyError::Io(e),
			other => ProxyError::UpstreamProtocol(other),
		}
	}

	/// The status answered to the client, when one can still be sent.
	/// `None` closes without a response (TLS failures, mid-stream errors).
	pub fn status(&self) -> Option<u16> {
		match self {
			ProxyError::MalformedRequest(_) | ProxyError::AmbiguousLength => Some(400),
			ProxyError::PayloadTooLarge => Some(413),
			ProxyError::UpstreamUnreachable(_)
			| ProxyError::UpstreamTls(_)
			| ProxyError::UpstreamTimeout
			| ProxyError::UpstreamProtocol(_) => Some(502),
			ProxyError::StoreUnavailable(_) => Some(403),
			ProxyError::Internal(_) => Some(500),
			ProxyError::Tls(_) | ProxyError::Ca(_) | ProxyError::Cancelled | ProxyError::Io(_) => None,
		}
	}

	pub fn reason(status: u16) -> &'static str {
		match status {
			400 => "Bad Request",
			403 => "Forbidden",
			413 => "Payload Too Large",
			500 => "Internal Server Error",
			502 => "Bad Gateway",
			_ => "",
		}
	}
}

/// A synthetic response originating from the proxy itself. Always closes
/// the connection.
pub fn synthetic_response(id: u64, version: Version, status: u16, body: &str) -> Response {
	let mut headers = HeaderMap::new();
	headers.append("Content-Type", "text/plain; charset=utf-8");
	headers.append("Content-Length", body.len().to_string());
	headers.append("Connection", "close");
	Response {
		id,
		status,
		reason: ProxyError::reason(status).to_string(),
		version,
		headers,
		body: Bytes::from(body.to_string()),
		received_at: Utc::now(),
	}
}

pub fn blocked_response(id: u64, version: Version) -> Response {
	synthetic_response(id, version, 403, "Blocked by proxy policy.\n")
}
