//! TLS transport
//!
//! [`TlsAcceptor`] implements the [`Acceptor`] capability on top of
//! rustls. It performs the handshake under a timeout and reports the
//! protocol ALPN settled on so the controller can route the connection to
//! the HTTP/1.1 or HTTP/2 driver.
//!
//! ```no_run
//! use appserver::http::TlsConfig;
//!
//! let acceptor = TlsConfig::server()
//!     .cert_file("server.pem")?
//!     .key_file("server.key")?
//!     .http2(true)
//!     .build()?;
//! # Ok::<(), appserver::http::TlsError>(())
//! ```

pub mod builtin_cert;
pub mod config;

pub use config::{ServerConfigBuilder, TlsConfig};

use super::session::{Accepted, Acceptor, Protocol, WrapFuture};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),
}

/// rustls-backed acceptor
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
    config: Arc<rustls::ServerConfig>,
    handshake_timeout: Duration,
}

impl TlsAcceptor {
    pub fn new(config: Arc<rustls::ServerConfig>, handshake_timeout: Duration) -> Self {
        TlsAcceptor {
            inner: tokio_rustls::TlsAcceptor::from(config.clone()),
            config,
            handshake_timeout,
        }
    }

    /// ALPN identifiers offered to clients, in preference order
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.config.alpn_protocols
    }
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl Acceptor for TlsAcceptor {
    fn wrap<'a>(&'a self, stream: TcpStream) -> WrapFuture<'a> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.handshake_timeout, self.inner.accept(stream))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;

            let alpn = stream.get_ref().1.alpn_protocol().and_then(Protocol::from_alpn);
            tracing::trace!(alpn = ?alpn, "TLS handshake complete");

            Ok(Accepted {
                session: Box::new(stream),
                alpn,
                secure: true,
            })
        })
    }
}
