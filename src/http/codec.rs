//! HTTP/1.x framing over async byte streams.
//!
//! The codec is purely functional over its reader/writer: it never retries
//! I/O, never reorders headers, and surfaces short reads as
//! [`Error::UnexpectedEof`]. Header names are kept exactly as received.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{HeaderEntry, HeaderMap, Request, Response, Scheme, Version, next_request_id};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// EOF before the first byte of a message. A clean keep-alive close, not
	/// an error in the protocol sense.
	#[error("connection closed")]
	Closed,
	#[error("unexpected end of stream")]
	UnexpectedEof,
	#[error("malformed request: {0}")]
	MalformedRequest(String),
	#[error("header line or section too large")]
	MalformedHeader,
	#[error("conflicting message length")]
	AmbiguousLength,
	#[error("declared payload exceeds the configured cap")]
	PayloadTooLarge,
	#[error("io: {0}")]
	Io(std::io::Error),
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		if e.kind() == std::io::ErrorKind::UnexpectedEof {
			Error::UnexpectedEof
		} else {
			Error::Io(e)
		}
	}
}

#[derive(Clone, Copy, Debug)]
pub struct Limits {
	/// Cap on any single line (request line, status line, header, chunk size).
	pub max_line_bytes: usize,
	/// Cap on the whole header section, CRLFs included.
	pub max_header_bytes: usize,
	/// Cap on a buffered body.
	pub max_body_bytes: usize,
}

impl Default for Limits {
	fn default() -> Self {
		Self {
			max_line_bytes: 64 * 1024,
			max_header_bytes: 256 * 1024,
			max_body_bytes: 10 * 1024 * 1024,
		}
	}
}

/// How a message body is delimited on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyFraming {
	/// No body at all (CONNECT, HEAD responses, 1xx/204/304, requests
	/// without length or chunking).
	None,
	Length(u64),
	Chunked,
	/// Read until the peer closes (`Connection: close` responses).
	Eof,
}

/// The parsed request-line target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
	/// `/path?query`, the common case.
	Origin(String),
	/// `http://host:port/path`, the forward-proxy plaintext form.
	Absolute {
		scheme: Scheme,
		host: String,
		port: u16,
		path: String,
	},
	/// `host:port`, as sent by CONNECT.
	Authority { host: String, port: u16 },
	/// `*`, for server-wide OPTIONS.
	Asterisk,
}

/// Reads one CRLF-terminated line, enforcing `max`. The terminator is
/// consumed but not returned. EOF with nothing read yields `Closed`.
async fn read_line<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, Error>
where
	R: AsyncBufRead + Unpin,
{
	let mut line = Vec::new();
	loop {
		let buf = reader.fill_buf().await?;
		if buf.is_empty() {
			return if line.is_empty() {
				Err(Error::Closed)
			} else {
				Err(Error::UnexpectedEof)
			};
		}
		match buf.iter().position(|&b| b == b'\n') {
			Some(pos) => {
				if line.len() + pos + 1 > max {
					return Err(Error::MalformedHeader);
				}
				line.extend_from_slice(&buf[..pos]);
				reader.consume(pos + 1);
				if line.last() == Some(&b'\r') {
					line.pop();
				}
				return Ok(line);
			},
			None => {
				if line.len() + buf.len() > max {
					return Err(Error::MalformedHeader);
				}
				line.extend_from_slice(buf);
				let n = buf.len();
				reader.consume(n);
			},
		}
	}
}

/// Reads header lines until the blank line, enforcing the section cap.
/// Returns the entries and the byte count consumed.
async fn read_header_section<R>(
	reader: &mut R,
	limits: &Limits,
	from_trailer: bool,
) -> Result<(Vec<HeaderEntry>, usize), Error>
where
	R: AsyncBufRead + Unpin,
{
	let mut entries = Vec::new();
	let mut consumed = 0usize;
	loop {
		let line = read_line(reader, limits.max_line_bytes).await.map_err(|e| {
			// Mid-section EOF is never a clean close.
			if matches!(e, Error::Closed) {
				Error::UnexpectedEof
			} else {
				e
			}
		})?;
		consumed += line.len() + 2;
		if consumed > limits.max_header_bytes {
			return Err(Error::MalformedHeader);
		}
		if line.is_empty() {
			return Ok((entries, consumed));
		}
		let colon = line
			.iter()
			.position(|&b| b == b':')
			.ok_or_else(|| Error::MalformedRequest("header line without colon".into()))?;
		let name = std::str::from_utf8(&line[..colon])
			.map_err(|_| Error::MalformedRequest("non-UTF-8 header name".into()))?
			.trim_end()
			.to_string();
		if name.is_empty() {
			return Err(Error::MalformedRequest("empty header name".into()));
		}
		let value = trim_ows(&line[colon + 1..]);
		entries.push(HeaderEntry {
			name,
			value: Bytes::copy_from_slice(value),
			from_trailer,
		});
	}
}

fn trim_ows(mut v: &[u8]) -> &[u8] {
	while let [b' ' | b'\t', rest @ ..] = v {
		v = rest;
	}
	while let [rest @ .., b' ' | b'\t'] = v {
		v = rest;
	}
	v
}

fn parse_version(s: &str) -> Result<Version, Error> {
	match s {
		"HTTP/1.0" => Ok(Version::Http10),
		"HTTP/1.1" => Ok(Version::Http11),
		other => Err(Error::MalformedRequest(format!(
			"unsupported version {other:?}"
		))),
	}
}

pub fn parse_target(method: &str, raw: &str) -> Result<Target, Error> {
	if method.eq_ignore_ascii_case("CONNECT") {
		let (host, port) = split_host_port(raw, 443)?;
		return Ok(Target::Authority { host, port });
	}
	if raw == "*" {
		return Ok(Target::Asterisk);
	}
	if raw.starts_with('/') {
		return Ok(Target::Origin(raw.to_string()));
	}
	let (scheme, rest) = if let Some(rest) = raw.strip_prefix("http://") {
		(Scheme::Http, rest)
	} else if let Some(rest) = raw.strip_prefix("https://") {
		(Scheme::Https, rest)
	} else {
		return Err(Error::MalformedRequest(format!(
			"unsupported request target {raw:?}"
		)));
	};
	let (authority, path) = match rest.find('/') {
		Some(idx) => (&rest[..idx], rest[idx..].to_string()),
		None => (rest, "/".to_string()),
	};
	let (host, port) = split_host_port(authority, scheme.default_port())?;
	Ok(Target::Absolute {
		scheme,
		host,
		port,
		path,
	})
}

/// Splits `host[:port]`, tolerating bracketed IPv6 literals.
pub fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), Error> {
	if authority.is_empty() {
		return Err(Error::MalformedRequest("empty authority".into()));
	}
	if let Some(rest) = authority.strip_prefix('[') {
		let end = rest
			.find(']')
			.ok_or_else(|| Error::MalformedRequest("unterminated IPv6 literal".into()))?;
		let host = rest[..end].to_string();
		let port = match rest[end + 1..].strip_prefix(':') {
			Some(p) => p
				.parse()
				.map_err(|_| Error::MalformedRequest(format!("bad port {p:?}")))?,
			None => default_port,
		};
		return Ok((host, port));
	}
	match authority.rsplit_once(':') {
		Some((host, port)) => {
			let port = port
				.parse()
				.map_err(|_| Error::MalformedRequest(format!("bad port {port:?}")))?;
			Ok((host.to_string(), port))
		},
		None => Ok((authority.to_string(), default_port)),
	}
}

/// Resolves request body framing from the header block, rejecting the
/// smuggling-prone combinations.
fn request_framing(headers: &HeaderMap) -> Result<BodyFraming, Error> {
	let chunked = headers.is_chunked();
	let lengths = headers.content_lengths();
	if lengths.len() > 1 || (chunked && !lengths.is_empty()) {
		return Err(Error::AmbiguousLength);
	}
	if chunked {
		return Ok(BodyFraming::Chunked);
	}
	match lengths.first() {
		Some(Some(0)) | None => Ok(BodyFraming::None),
		Some(Some(n)) => Ok(BodyFraming::Length(*n)),
		Some(None) => Err(Error::MalformedRequest("unparseable Content-Length".into())),
	}
}

/// Reads and fully buffers one request. The caller supplies connection
/// context (scheme, tunnel target, peer address) afterwards; absolute-form
/// targets override it here.
pub async fn decode_request<R>(reader: &mut R, limits: &Limits) -> Result<Request, Error>
where
	R: AsyncBufRead + Unpin,
{
	let line = read_line(reader, limits.max_line_bytes).await?;
	let line = std::str::from_utf8(&line)
		.map_err(|_| Error::MalformedRequest("non-UTF-8 request line".into()))?;
	let mut parts = line.split(' ').filter(|p| !p.is_empty());
	let (method, raw_target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
	{
		(Some(m), Some(t), Some(v), None) => (m, t, v),
		_ => {
			return Err(Error::MalformedRequest(format!(
				"bad request line {line:?}"
			)));
		},
	};
	let version = parse_version(version)?;
	let target = parse_target(method, raw_target)?;

	let (entries, _) = read_header_section(reader, limits, false).await?;
	let mut headers = HeaderMap::new();
	for e in entries {
		headers.push(e);
	}

	let (scheme, host, port, path) = match target {
		Target::Origin(path) => (Scheme::Http, String::new(), 0, path),
		Target::Absolute {
			scheme,
			host,
			port,
			path,
		} => (scheme, host, port, path),
		Target::Authority { host, port } => (Scheme::Https, host, port, raw_target.to_string()),
		Target::Asterisk => (Scheme::Http, String::new(), 0, "*".to_string()),
	};

	let framing = if method.eq_ignore_ascii_case("CONNECT") {
		BodyFraming::None
	} else {
		request_framing(&headers)?
	};
	let (body, trailers) = read_body(reader, framing, limits).await?;
	for t in trailers {
		headers.push(t);
	}

	Ok(Request {
		id: next_request_id(),
		method: method.to_string(),
		scheme,
		host,
		port,
		path,
		version,
		headers,
		body,
		received_at: Utc::now(),
		client_addr: None,
	})
}

/// Reads a status line and header block. Body handling is split out so the
/// caller can choose between buffering (review) and streaming (relay).
pub async fn decode_response_head<R>(
	reader: &mut R,
	limits: &Limits,
	id: u64,
	request_method: &str,
) -> Result<(Response, BodyFraming), Error>
where
	R: AsyncBufRead + Unpin,
{
	let line = read_line(reader, limits.max_line_bytes).await?;
	let line = std::str::from_utf8(&line)
		.map_err(|_| Error::MalformedRequest("non-UTF-8 status line".into()))?;
	let mut parts = line.splitn(3, ' ');
	let (version, status, reason) = match (parts.next(), parts.next(), parts.next()) {
		(Some(v), Some(s), reason) => (v, s, reason.unwrap_or("")),
		_ => return Err(Error::MalformedRequest(format!("bad status line {line:?}"))),
	};
	let version = parse_version(version)?;
	let status: u16 = status
		.parse()
		.map_err(|_| Error::MalformedRequest(format!("bad status code {status:?}")))?;

	let (entries, _) = read_header_section(reader, limits, false).await?;
	let mut headers = HeaderMap::new();
	for e in entries {
		headers.push(e);
	}

	let framing = response_framing(status, request_method, &headers)?;
	Ok((
		Response {
			id,
			status,
			reason: reason.to_string(),
			version,
			headers,
			body: Bytes::new(),
			received_at: Utc::now(),
		},
		framing,
	))
}

fn response_framing(
	status: u16,
	request_method: &str,
	headers: &HeaderMap,
) -> Result<BodyFraming, Error> {
	if request_method.eq_ignore_ascii_case("HEAD")
		|| (100..200).contains(&status)
		|| status == 204
		|| status == 304
	{
		return Ok(BodyFraming::None);
	}
	let chunked = headers.is_chunked();
	let lengths = headers.content_lengths();
	if lengths.len() > 1 || (chunked && !lengths.is_empty()) {
		return Err(Error::AmbiguousLength);
	}
	if chunked {
		return Ok(BodyFraming::Chunked);
	}
	match lengths.first() {
		Some(Some(n)) => Ok(BodyFraming::Length(*n)),
		Some(None) => Err(Error::MalformedRequest("unparseable Content-Length".into())),
		// Lacking both length and chunking, a response runs to EOF.
		None => Ok(BodyFraming::Eof),
	}
}

/// Convenience for callers that always buffer (store records, tests).
pub async fn decode_response<R>(
	reader: &mut R,
	limits: &Limits,
	id: u64,
	request_method: &str,
) -> Result<Response, Error>
where
	R: AsyncBufRead + Unpin,
{
	let (mut resp, framing) = decode_response_head(reader, limits, id, request_method).await?;
	let (body, trailers) = read_body(reader, framing, limits).await?;
	resp.body = body;
	for t in trailers {
		resp.headers.push(t);
	}
	Ok(resp)
}

/// Buffers a body per its framing, enforcing the cap. Chunked trailers come
/// back separately, tagged for re-emission.
pub async fn read_body<R>(
	reader: &mut R,
	framing: BodyFraming,
	limits: &Limits,
) -> Result<(Bytes, Vec<HeaderEntry>), Error>
where
	R: AsyncBufRead + Unpin,
{
	match framing {
		BodyFraming::None => Ok((Bytes::new(), Vec::new())),
		BodyFraming::Length(n) => {
			if n > limits.max_body_bytes as u64 {
				return Err(Error::PayloadTooLarge);
			}
			let mut buf = BytesMut::zeroed(n as usize);
			reader.read_exact(&mut buf).await?;
			Ok((buf.freeze(), Vec::new()))
		},
		BodyFraming::Chunked => {
			let mut body = BytesMut::new();
			loop {
				let size = read_chunk_size(reader, limits).await?;
				if size == 0 {
					break;
				}
				if body.len() as u64 + size > limits.max_body_bytes as u64 {
					return Err(Error::PayloadTooLarge);
				}
				let start = body.len();
				body.resize(start + size as usize, 0);
				reader.read_exact(&mut body[start..]).await?;
				read_chunk_terminator(reader).await?;
			}
			let (trailers, _) = read_header_section(reader, limits, true).await?;
			Ok((body.freeze(), trailers))
		},
		BodyFraming::Eof => {
			let mut body = Vec::new();
			let mut chunk = [0u8; 8 * 1024];
			loop {
				let n = reader.read(&mut chunk).await?;
				if n == 0 {
					break;
				}
				if body.len() + n > limits.max_body_bytes {
					return Err(Error::PayloadTooLarge);
				}
				body.extend_from_slice(&chunk[..n]);
			}
			Ok((Bytes::from(body), Vec::new()))
		},
	}
}

async fn read_chunk_size<R>(reader: &mut R, limits: &Limits) -> Result<u64, Error>
where
	R: AsyncBufRead + Unpin,
{
	let line = read_line(reader, limits.max_line_bytes).await.map_err(|e| {
		if matches!(e, Error::Closed) {
			Error::UnexpectedEof
		} else {
			e
		}
	})?;
	let line = std::str::from_utf8(&line)
		.map_err(|_| Error::MalformedRequest("non-UTF-8 chunk size".into()))?;
	// Chunk extensions are tolerated and dropped.
	let size = line.split(';').next().unwrap_or("").trim();
	u64::from_str_radix(size, 16)
		.map_err(|_| Error::MalformedRequest(format!("bad chunk size {size:?}")))
}

async fn read_chunk_terminator<R>(reader: &mut R) -> Result<(), Error>
where
	R: AsyncBufRead + Unpin,
{
	let mut crlf = [0u8; 2];
	reader.read_exact(&mut crlf).await?;
	if &crlf != b"\r\n" {
		return Err(Error::MalformedRequest("chunk data not CRLF-terminated".into()));
	}
	Ok(())
}

/// Streams a body from `reader` to `writer` per its framing, in lockstep.
/// Chunked input is re-chunked (sizes may differ, content may not); trailers
/// pass through. Returns the number of body bytes relayed.
pub async fn copy_body<R, W>(
	reader: &mut R,
	writer: &mut W,
	framing: BodyFraming,
	limits: &Limits,
) -> Result<u64, Error>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut relayed = 0u64;
	match framing {
		BodyFraming::None => {},
		BodyFraming::Length(mut remaining) => {
			let mut chunk = [0u8; 8 * 1024];
			while remaining > 0 {
				let want = remaining.min(chunk.len() as u64) as usize;
				let n = reader.read(&mut chunk[..want]).await?;
				if n == 0 {
					return Err(Error::UnexpectedEof);
				}
				writer.write_all(&chunk[..n]).await?;
				writer.flush().await?;
				remaining -= n as u64;
				relayed += n as u64;
			}
		},
		BodyFraming::Chunked => {
			let mut chunk = [0u8; 8 * 1024];
			loop {
				let size = read_chunk_size(reader, limits).await?;
				if size == 0 {
					break;
				}
				writer
					.write_all(format!("{size:x}\r\n").as_bytes())
					.await?;
				let mut remaining = size;
				while remaining > 0 {
					let want = remaining.min(chunk.len() as u64) as usize;
					let n = reader.read(&mut chunk[..want]).await?;
					if n == 0 {
						return Err(Error::UnexpectedEof);
					}
					writer.write_all(&chunk[..n]).await?;
					remaining -= n as u64;
					relayed += n as u64;
				}
				read_chunk_terminator(reader).await?;
				writer.write_all(b"\r\n").await?;
				writer.flush().await?;
			}
			writer.write_all(b"0\r\n").await?;
			let (trailers, _) = read_header_section(reader, limits, true).await?;
			for t in &trailers {
				writer.write_all(t.name.as_bytes()).await?;
				writer.write_all(b": ").await?;
				writer.write_all(&t.value).await?;
				writer.write_all(b"\r\n").await?;
			}
			writer.write_all(b"\r\n").await?;
			writer.flush().await?;
		},
		BodyFraming::Eof => {
			let mut chunk = [0u8; 8 * 1024];
			loop {
				let n = reader.read(&mut chunk).await?;
				if n == 0 {
					break;
				}
				writer.write_all(&chunk[..n]).await?;
				writer.flush().await?;
				relayed += n as u64;
			}
		},
	}
	Ok(relayed)
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap, trailer: bool) {
	for e in headers.iter().filter(|e| e.from_trailer == trailer) {
		out.extend_from_slice(e.name.as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(&e.value);
		out.extend_from_slice(b"\r\n");
	}
}

fn encode_message(
	out: &mut Vec<u8>,
	headers: &HeaderMap,
	body: &Bytes,
	chunked: bool,
) {
	write_headers(out, headers, false);
	out.extend_from_slice(b"\r\n");
	if chunked {
		// Re-chunked as a single chunk; trailer-origin entries follow the
		// zero chunk, where they came from.
		if !body.is_empty() {
			out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
			out.extend_from_slice(body);
			out.extend_from_slice(b"\r\n");
		}
		out.extend_from_slice(b"0\r\n");
		write_headers(out, headers, true);
		out.extend_from_slice(b"\r\n");
	} else {
		out.extend_from_slice(body);
	}
}

/// Serializes a request in origin-form (the form an origin server expects).
pub async fn encode_request<W>(writer: &mut W, req: &Request) -> Result<(), Error>
where
	W: AsyncWrite + Unpin,
{
	let mut out = Vec::with_capacity(256 + req.body.len());
	out.extend_from_slice(req.method.as_bytes());
	out.push(b' ');
	out.extend_from_slice(req.path.as_bytes());
	out.push(b' ');
	out.extend_from_slice(req.version.as_str().as_bytes());
	out.extend_from_slice(b"\r\n");
	encode_message(&mut out, &req.headers, &req.body, req.headers.is_chunked());
	writer.write_all(&out).await?;
	writer.flush().await?;
	Ok(())
}

/// Serializes a status line and header block only; the caller streams the
/// body behind it (trailer-origin entries are left for the body framing).
pub async fn encode_response_head<W>(writer: &mut W, resp: &Response) -> Result<(), Error>
where
	W: AsyncWrite + Unpin,
{
	let mut out = Vec::with_capacity(256);
	write_status_line(&mut out, resp);
	write_headers(&mut out, &resp.headers, false);
	out.extend_from_slice(b"\r\n");
	writer.write_all(&out).await?;
	writer.flush().await?;
	Ok(())
}

fn write_status_line(out: &mut Vec<u8>, resp: &Response) {
	out.extend_from_slice(resp.version.as_str().as_bytes());
	out.extend_from_slice(format!(" {}", resp.status).as_bytes());
	if !resp.reason.is_empty() {
		out.push(b' ');
		out.extend_from_slice(resp.reason.as_bytes());
	}
	out.extend_from_slice(b"\r\n");
}

pub async fn encode_response<W>(writer: &mut W, resp: &Response) -> Result<(), Error>
where
	W: AsyncWrite + Unpin,
{
	let mut out = Vec::with_capacity(256 + resp.body.len());
	write_status_line(&mut out, resp);
	encode_message(&mut out, &resp.headers, &resp.body, resp.headers.is_chunked());
	writer.write_all(&out).await?;
	writer.flush().await?;
	Ok(())
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
