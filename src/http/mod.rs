pub mod codec;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a process-wide unique, monotonically increasing request id.
pub fn next_request_id() -> u64 {
	NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
	Http,
	Https,
}

impl Scheme {
	pub fn default_port(&self) -> u16 {
		match self {
			Scheme::Http => 80,
			Scheme::Https => 443,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Scheme::Http => "http",
			Scheme::Https => "https",
		}
	}
}

impl fmt::Display for Scheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Version {
	#[serde(rename = "HTTP/1.0")]
	Http10,
	#[serde(rename = "HTTP/1.1")]
	Http11,
}

impl Version {
	pub fn as_str(&self) -> &'static str {
		match self {
			Version::Http10 => "HTTP/1.0",
			Version::Http11 => "HTTP/1.1",
		}
	}
}

impl fmt::Display for Version {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One header line as it appeared on the wire. Name case and value bytes are
/// preserved exactly; `from_trailer` marks entries that arrived in a chunked
/// trailer section so the encoder can put them back there.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HeaderEntry {
	pub name: String,
	pub value: Bytes,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub from_trailer: bool,
}

impl HeaderEntry {
	pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
		Self {
			name: name.into(),
			value: value.into(),
			from_trailer: false,
		}
	}
}

/// Ordered multimap of headers. Iteration yields insertion order; lookups are
/// case-insensitive; nothing is canonicalized.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct HeaderMap {
	entries: Vec<HeaderEntry>,
}

impl HeaderMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, entry: HeaderEntry) {
		self.entries.push(entry);
	}

	pub fn append(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
		self.entries.push(HeaderEntry::new(name, value));
	}

	pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
		self.entries.iter()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// First value for `name`, compared case-insensitively.
	pub fn get(&self, name: &str) -> Option<&[u8]> {
		self
			.entries
			.iter()
			.find(|e| e.name.eq_ignore_ascii_case(name))
			.map(|e| e.value.as_ref())
	}

	pub fn get_str(&self, name: &str) -> Option<&str> {
		self.get(name).and_then(|v| std::str::from_utf8(v).ok())
	}

	pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
		self
			.entries
			.iter()
			.filter(move |e| e.name.eq_ignore_ascii_case(name))
			.map(|e| e.value.as_ref())
	}

	pub fn contains(&self, name: &str) -> bool {
		self.get(name).is_some()
	}

	/// Replaces every occurrence of `name` with a single entry, or appends one.
	/// The original name casing of the first occurrence is kept.
	pub fn set(&mut self, name: &str, value: impl Into<Bytes>) {
		let value = value.into();
		let mut kept = false;
		self.entries.retain_mut(|e| {
			if !e.name.eq_ignore_ascii_case(name) {
				return true;
			}
			if kept {
				return false;
			}
			kept = true;
			e.value = value.clone();
			true
		});
		if !kept {
			self.append(name.to_string(), value);
		}
	}

	pub fn remove(&mut self, name: &str) {
		self.entries.retain(|e| !e.name.eq_ignore_ascii_case(name));
	}

	/// `Transfer-Encoding: chunked` on any entry. Only the chunked coding is
	/// supported; compound codings are treated as chunked if chunked is last.
	pub fn is_chunked(&self) -> bool {
		self.get_all("transfer-encoding").any(|v| {
			std::str::from_utf8(v)
				.map(|s| {
					s.split(',')
						.next_back()
						.map(|c| c.trim().eq_ignore_ascii_case("chunked"))
						.unwrap_or(false)
				})
				.unwrap_or(false)
		})
	}

	/// All Content-Length values, parsed. More than one entry (even repeated
	/// identical ones) is reported so the codec can reject the message.
	pub fn content_lengths(&self) -> Vec<Option<u64>> {
		self
			.get_all("content-length")
			.map(|v| std::str::from_utf8(v).ok().and_then(|s| s.trim().parse().ok()))
			.collect()
	}

	/// Whether the `Connection` header asks to close the connection.
	pub fn connection_close(&self) -> bool {
		self.connection_has_token("close")
	}

	pub fn connection_keep_alive(&self) -> bool {
		self.connection_has_token("keep-alive")
	}

	fn connection_has_token(&self, token: &str) -> bool {
		self.get_all("connection").any(|v| {
			std::str::from_utf8(v)
				.map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
				.unwrap_or(false)
		})
	}
}

/// A fully parsed client request, as held for policy evaluation and review.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
	pub id: u64,
	pub method: String,
	pub scheme: Scheme,
	pub host: String,
	pub port: u16,
	/// Origin-form target, including the query string.
	pub path: String,
	pub version: Version,
	pub headers: HeaderMap,
	#[serde(with = "serde_bytes_b64")]
	pub body: Bytes,
	pub received_at: DateTime<Utc>,
	pub client_addr: Option<SocketAddr>,
}

impl Request {
	/// Renormalizes `Content-Length` after a body edit. Chunked messages keep
	/// their framing; everything else gets an accurate length.
	pub fn sync_content_length(&mut self) {
		if self.headers.is_chunked() {
			return;
		}
		if self.body.is_empty() && !self.headers.contains("content-length") {
			return;
		}
		self.headers.set("Content-Length", self.body.len().to_string());
	}
}

/// An origin response, possibly buffered for review.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
	pub id: u64,
	pub status: u16,
	pub reason: String,
	pub version: Version,
	pub headers: HeaderMap,
	#[serde(with = "serde_bytes_b64")]
	pub body: Bytes,
	pub received_at: DateTime<Utc>,
}

impl Response {
	pub fn sync_content_length(&mut self) {
		if self.headers.is_chunked() {
			return;
		}
		if self.body.is_empty() && !self.headers.contains("content-length") {
			return;
		}
		self.headers.set("Content-Length", self.body.len().to_string());
	}
}

/// Bodies are arbitrary bytes; JSON-encode them as base64 so store records
/// survive any backing store.
mod serde_bytes_b64 {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use bytes::Bytes;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
		ser.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
		let s = String::deserialize(de)?;
		STANDARD
			.decode(&s)
			.map(Bytes::from)
			.map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_lookup_is_case_insensitive_and_order_preserving() {
		let mut h = HeaderMap::new();
		h.append("Host", "example.test");
		h.append("X-Custom", "a");
		h.append("x-custom", "b");
		assert_eq!(h.get_str("HOST"), Some("example.test"));
		assert_eq!(h.get_all("X-CUSTOM").count(), 2);
		let names: Vec<_> = h.iter().map(|e| e.name.as_str()).collect();
		assert_eq!(names, vec!["Host", "X-Custom", "x-custom"]);
	}

	#[test]
	fn set_collapses_duplicates_in_place() {
		let mut h = HeaderMap::new();
		h.append("Content-Length", "3");
		h.append("Accept", "*/*");
		h.append("content-length", "7");
		h.set("content-length", "11");
		assert_eq!(h.get_all("content-length").count(), 1);
		assert_eq!(h.get_str("Content-Length"), Some("11"));
		assert_eq!(h.iter().next().unwrap().name, "Content-Length");
	}

	#[test]
	fn chunked_detection_uses_last_coding() {
		let mut h = HeaderMap::new();
		h.append("Transfer-Encoding", "gzip, chunked");
		assert!(h.is_chunked());
		let mut h = HeaderMap::new();
		h.append("Transfer-Encoding", "chunked, gzip");
		assert!(!h.is_chunked());
	}

	#[test]
	fn request_ids_are_monotonic() {
		let a = next_request_id();
		let b = next_request_id();
		assert!(b > a);
	}

	#[test]
	fn body_survives_json_round_trip() {
		let req = Request {
			id: 1,
			method: "POST".into(),
			scheme: Scheme::Http,
			host: "example.test".into(),
			port: 80,
			path: "/login".into(),
			version: Version::Http11,
			headers: HeaderMap::new(),
			body: Bytes::from_static(&[0x00, 0xff, 0x7f, b'a']),
			received_at: Utc::now(),
			client_addr: None,
		};
		let json = serde_json::to_string(&req).unwrap();
		let back: Request = serde_json::from_str(&json).unwrap();
		assert_eq!(back.body, req.body);
	}
}
