//! Transport abstraction
//!
//! Connection drivers only ever see a [`BoxedSession`]: a byte stream that
//! may be plain TCP or TLS. The [`Acceptor`] capability turns an accepted
//! socket into a session and reports what ALPN negotiated, so the
//! controller can pick a protocol without knowing how the transport was
//! secured.

use super::h2::CONNECTION_PREFACE as H2_PREFACE;
use bytes::BytesMut;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

/// A duplex byte stream a connection driver can run over
pub trait Session: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Session for T {}

/// Type-erased session
pub type BoxedSession = Box<dyn Session>;

/// Application protocol spoken on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

impl Protocol {
    /// Map an ALPN identifier to a protocol
    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        match id {
            b"h2" => Some(Protocol::Http2),
            b"http/1.1" | b"http/1.0" => Some(Protocol::Http1),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::Http2 => "h2",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of wrapping an accepted socket
pub struct Accepted {
    pub session: BoxedSession,
    /// Protocol chosen during the handshake, if any
    pub alpn: Option<Protocol>,
    pub secure: bool,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("alpn", &self.alpn)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

/// Future returned by [`Acceptor::wrap`]
pub type WrapFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Accepted>> + Send + 'a>>;

/// Capability turning a raw socket into a session
///
/// Implemented by [`PlainAcceptor`] and the rustls-backed
/// [`TlsAcceptor`](super::TlsAcceptor). Selected once when the server is
/// built.
pub trait Acceptor: Send + Sync {
    fn wrap<'a>(&'a self, stream: TcpStream) -> WrapFuture<'a>;
}

/// Cleartext acceptor
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAcceptor;

impl Acceptor for PlainAcceptor {
    fn wrap<'a>(&'a self, stream: TcpStream) -> WrapFuture<'a> {
        Box::pin(async move {
            Ok(Accepted {
                session: Box::new(stream),
                alpn: None,
                secure: false,
            })
        })
    }
}

/// Decide between HTTP/1.1 and prior-knowledge HTTP/2 from the first bytes
///
/// Bytes are read into `buf` until they either diverge from the HTTP/2
/// client preface or match it completely. Everything read stays in `buf`
/// for the chosen driver. A connection closed before any byte arrives is
/// reported as HTTP/1.1 with an empty buffer.
pub async fn sniff_protocol<S>(io: &mut S, buf: &mut BytesMut) -> io::Result<Protocol>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        let n = buf.len().min(H2_PREFACE.len());
        if buf[..n] != H2_PREFACE[..n] {
            return Ok(Protocol::Http1);
        }
        if n == H2_PREFACE.len() {
            return Ok(Protocol::Http2);
        }
        if io.read_buf(buf).await? == 0 {
            return Ok(Protocol::Http1);
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection facts shared by both protocol drivers
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub secure: bool,
}

impl ConnectionInfo {
    pub fn new(peer: SocketAddr, secure: bool) -> Self {
        ConnectionInfo {
            id: ConnectionId::next(),
            peer,
            secure,
        }
    }

    /// URL scheme requests on this connection carry
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}
