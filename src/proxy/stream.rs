//! Connection stream wrappers: one enum for the plaintext / impersonated /
//! upstream-TLS variants, plus a rewind buffer for bytes read past a
//! CONNECT head before the TLS handshake takes over the socket.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Replays `buf` before reading from the socket. A client may pipeline its
/// TLS ClientHello behind the CONNECT head; those bytes land in the parse
/// buffer and must be fed to the handshake.
pub struct Rewind {
	buf: Bytes,
	io: TcpStream,
}

impl Rewind {
	pub fn new(buf: Bytes, io: TcpStream) -> Self {
		Self { buf, io }
	}

	pub fn tcp(&self) -> &TcpStream {
		&self.io
	}
}

impl AsyncRead for Rewind {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		if !self.buf.is_empty() {
			let n = self.buf.len().min(buf.remaining());
			buf.put_slice(&self.buf.split_to(n));
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut self.io).poll_read(cx, buf)
	}
}

impl AsyncWrite for Rewind {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		data: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.io).poll_write(cx, data)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.io).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.io).poll_shutdown(cx)
	}
}

/// One end of a proxied connection. Client sockets start as `Tcp` and may
/// become `Tls` after impersonation; upstream sockets are `Tcp` or
/// `TlsClient`.
pub enum Stream {
	Tcp(TcpStream),
	Tls(Box<tokio_rustls::server::TlsStream<Rewind>>),
	TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Stream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Stream::Tcp(_) => f.write_str("Stream::Tcp"),
			Stream::Tls(_) => f.write_str("Stream::Tls"),
			Stream::TlsClient(_) => f.write_str("Stream::TlsClient"),
		}
	}
}

impl Stream {
	/// The raw socket underneath, for liveness probes and peer addresses.
	pub fn tcp(&self) -> &TcpStream {
		match self {
			Stream::Tcp(s) => s,
			Stream::Tls(s) => s.get_ref().0.tcp(),
			Stream::TlsClient(s) => s.get_ref().0,
		}
	}

	pub fn peer_addr(&self) -> io::Result<SocketAddr> {
		self.tcp().peer_addr()
	}

	pub fn is_tls(&self) -> bool {
		!matches!(self, Stream::Tcp(_))
	}
}

impl AsyncRead for Stream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
			Stream::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Stream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			Stream::Tcp(s) => Pin::new(s).poll_write(cx, data),
			Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
			Stream::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, data),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
			Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
			Stream::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
			Stream::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}
