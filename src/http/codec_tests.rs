use test_case::test_case;
use tokio::io::BufReader;

use super::*;
use crate::http::Scheme;

fn limits() -> Limits {
	Limits::default()
}

async fn decode(bytes: &[u8]) -> Result<Request, Error> {
	let mut reader = BufReader::new(bytes);
	decode_request(&mut reader, &limits()).await
}

async fn encode(req: &Request) -> Vec<u8> {
	let mut out = Vec::new();
	encode_request(&mut out, req).await.unwrap();
	out
}

#[tokio::test]
async fn request_round_trips_byte_for_byte() {
	let raw = b"POST /login HTTP/1.1\r\n\
		Host: example.test\r\n\
		X-CuStOm: MiXeD\r\n\
		Content-Length: 17\r\n\
		\r\n\
		{\"u\":\"a\",\"p\":\"b\"}";
	let req = decode(raw).await.unwrap();
	assert_eq!(req.method, "POST");
	assert_eq!(req.path, "/login");
	assert_eq!(req.headers.iter().nth(1).unwrap().name, "X-CuStOm");
	assert_eq!(encode(&req).await, raw);
}

#[tokio::test]
async fn absolute_form_target_is_rewritten() {
	let raw = b"GET http://example.test:8080/a/b?q=1 HTTP/1.1\r\nHost: example.test\r\n\r\n";
	let req = decode(raw).await.unwrap();
	assert_eq!(req.scheme, Scheme::Http);
	assert_eq!(req.host, "example.test");
	assert_eq!(req.port, 8080);
	assert_eq!(req.path, "/a/b?q=1");
	// Re-encoding uses origin-form, the shape an origin server expects.
	let encoded = encode(&req).await;
	assert!(encoded.starts_with(b"GET /a/b?q=1 HTTP/1.1\r\n"));
}

#[test_case("CONNECT", "secure.test:443", Target::Authority { host: "secure.test".into(), port: 443 })]
#[test_case("CONNECT", "localhost", Target::Authority { host: "localhost".into(), port: 443 })]
#[test_case("GET", "/x", Target::Origin("/x".into()))]
#[test_case("OPTIONS", "*", Target::Asterisk)]
#[test_case("GET", "https://h.test", Target::Absolute { scheme: Scheme::Https, host: "h.test".into(), port: 443, path: "/".into() })]
fn target_forms(method: &str, raw: &str, expected: Target) {
	assert_eq!(parse_target(method, raw).unwrap(), expected);
}

#[tokio::test]
async fn chunked_body_with_trailers_round_trips() {
	let raw = b"POST /u HTTP/1.1\r\n\
		Host: h.test\r\n\
		Transfer-Encoding: chunked\r\n\
		\r\n\
		4\r\nWiki\r\n\
		5\r\npedia\r\n\
		0\r\n\
		X-Checksum: abc\r\n\
		\r\n";
	let req = decode(raw).await.unwrap();
	assert_eq!(req.body.as_ref(), b"Wikipedia");
	let trailer = req.headers.iter().find(|e| e.from_trailer).unwrap();
	assert_eq!(trailer.name, "X-Checksum");

	// Re-encoding may re-chunk, but the decoded content must survive.
	let encoded = encode(&req).await;
	let again = decode(&encoded).await.unwrap();
	assert_eq!(again.body.as_ref(), b"Wikipedia");
	assert!(again.headers.iter().any(|e| e.from_trailer && e.name == "X-Checksum"));
}

#[tokio::test]
async fn chunk_extensions_are_dropped() {
	let raw = b"POST /u HTTP/1.1\r\n\
		Host: h.test\r\n\
		Transfer-Encoding: chunked\r\n\
		\r\n\
		3;ext=1\r\nfoo\r\n\
		0\r\n\r\n";
	let req = decode(raw).await.unwrap();
	assert_eq!(req.body.as_ref(), b"foo");
}

#[tokio::test]
async fn duplicate_content_length_is_ambiguous() {
	let raw = b"POST /u HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 3\r\n\r\nfoo";
	assert!(matches!(decode(raw).await, Err(Error::AmbiguousLength)));
}

#[tokio::test]
async fn content_length_plus_chunked_is_ambiguous() {
	let raw =
		b"POST /u HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n0\r\n\r\n";
	assert!(matches!(decode(raw).await, Err(Error::AmbiguousLength)));
}

#[tokio::test]
async fn declared_length_beyond_cap_is_rejected_before_reading() {
	let mut small = limits();
	small.max_body_bytes = 8;
	let raw = b"POST /u HTTP/1.1\r\nContent-Length: 9\r\n\r\n123456789";
	let mut reader = BufReader::new(&raw[..]);
	assert!(matches!(
		decode_request(&mut reader, &small).await,
		Err(Error::PayloadTooLarge)
	));
}

#[tokio::test]
async fn header_section_cap_is_exact() {
	// Request line is not part of the header section; craft a section whose
	// byte count (lines + CRLFs + blank line) lands exactly on the cap.
	let value = "v".repeat(100);
	let section = format!("A: {value}\r\n\r\n");
	let mut exact = limits();
	exact.max_header_bytes = section.len();
	let raw = format!("GET / HTTP/1.1\r\n{section}");
	let mut reader = BufReader::new(raw.as_bytes());
	assert!(decode_request(&mut reader, &exact).await.is_ok());

	let mut too_small = limits();
	too_small.max_header_bytes = section.len() - 1;
	let mut reader = BufReader::new(raw.as_bytes());
	assert!(matches!(
		decode_request(&mut reader, &too_small).await,
		Err(Error::MalformedHeader)
	));
}

#[tokio::test]
async fn overlong_line_is_malformed() {
	let mut small = limits();
	small.max_line_bytes = 32;
	let raw = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(64));
	let mut reader = BufReader::new(raw.as_bytes());
	assert!(matches!(
		decode_request(&mut reader, &small).await,
		Err(Error::MalformedHeader)
	));
}

#[tokio::test]
async fn eof_before_first_byte_is_a_clean_close() {
	assert!(matches!(decode(b"").await, Err(Error::Closed)));
}

#[tokio::test]
async fn eof_mid_message_is_unexpected() {
	let raw = b"POST /u HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
	assert!(matches!(decode(raw).await, Err(Error::UnexpectedEof)));
	assert!(matches!(
		decode(b"GET / HT").await,
		Err(Error::UnexpectedEof)
	));
}

#[tokio::test]
async fn response_without_length_reads_to_eof() {
	let raw = b"HTTP/1.0 200 OK\r\nServer: t\r\n\r\nhello";
	let mut reader = BufReader::new(&raw[..]);
	let resp = decode_response(&mut reader, &limits(), 7, "GET").await.unwrap();
	assert_eq!(resp.status, 200);
	assert_eq!(resp.reason, "OK");
	assert_eq!(resp.body.as_ref(), b"hello");
	assert_eq!(resp.id, 7);
}

#[tokio::test]
async fn head_and_no_content_responses_have_no_body() {
	let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
	let mut reader = BufReader::new(&raw[..]);
	let (_, framing) = decode_response_head(&mut reader, &limits(), 1, "HEAD")
		.await
		.unwrap();
	assert_eq!(framing, BodyFraming::None);

	let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
	let mut reader = BufReader::new(&raw[..]);
	let (resp, framing) = decode_response_head(&mut reader, &limits(), 1, "GET")
		.await
		.unwrap();
	assert_eq!(resp.status, 204);
	assert_eq!(framing, BodyFraming::None);
}

#[tokio::test]
async fn reason_phrase_keeps_embedded_spaces() {
	let raw = b"HTTP/1.1 404 Not Found Here\r\nContent-Length: 0\r\n\r\n";
	let mut reader = BufReader::new(&raw[..]);
	let resp = decode_response(&mut reader, &limits(), 1, "GET").await.unwrap();
	assert_eq!(resp.reason, "Not Found Here");
}

#[tokio::test]
async fn copy_body_streams_sized_bodies_verbatim() {
	let mut reader = BufReader::new(&b"hello world"[..]);
	let mut out = Vec::new();
	let n = copy_body(&mut reader, &mut out, BodyFraming::Length(11), &limits())
		.await
		.unwrap();
	assert_eq!(n, 11);
	assert_eq!(out, b"hello world");
}

#[tokio::test]
async fn copy_body_rechunks_with_identical_content() {
	let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-T: 1\r\n\r\n";
	let mut reader = BufReader::new(&raw[..]);
	let mut out = Vec::new();
	let n = copy_body(&mut reader, &mut out, BodyFraming::Chunked, &limits())
		.await
		.unwrap();
	assert_eq!(n, 9);
	// Decode what was written and compare content, not framing.
	let mut reader = BufReader::new(out.as_slice());
	let (body, trailers) = read_body(&mut reader, BodyFraming::Chunked, &limits())
		.await
		.unwrap();
	assert_eq!(body.as_ref(), b"Wikipedia");
	assert_eq!(trailers.len(), 1);
	assert_eq!(trailers[0].name, "X-T");
}

#[tokio::test]
async fn connect_requests_never_have_a_body() {
	let raw = b"CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\n\r\n";
	let req = decode(raw).await.unwrap();
	assert_eq!(req.method, "CONNECT");
	assert_eq!(req.host, "secure.test");
	assert_eq!(req.port, 443);
	assert!(req.body.is_empty());
}
