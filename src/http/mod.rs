//! HTTP/1.1 and HTTP/2 protocol handling
//!
//! This module owns everything between the socket and the application:
//! the HTTP/1.1 request codec, the keep-alive/pipelining connection loop,
//! the HTTP/2 connection state machine and the transport abstraction that
//! hides whether a connection is plain TCP or TLS.
//!
//! # Architecture
//!
//! - [`session`] wraps an accepted socket behind the [`Acceptor`] capability
//!   and decides which protocol the connection speaks
//! - [`parser`] turns bytes into [`Request`] records while enforcing size limits
//! - [`server`] drives one HTTP/1.1 connection through its request cycles
//! - [`h2`] drives one multiplexed HTTP/2 connection
//!
//! Both connection drivers hand complete requests to the
//! [`streamer`](crate::streamer) and write its output back with the framing
//! their protocol requires.

pub mod chunked;
pub mod h2;
pub mod headers;
pub mod message;
pub mod parser;
pub mod server;
pub mod session;
pub mod tls;

pub use headers::Headers;
pub use message::{HttpResponse, Method, Request, ResponseHead, Status, Version};
pub use parser::{ParserLimits, RequestParser};
pub use server::Http1Connection;
pub use session::{Acceptor, Accepted, BoxedSession, ConnectionId, ConnectionInfo, PlainAcceptor, Protocol};
pub use tls::{TlsAcceptor, TlsConfig, TlsError};

use std::fmt;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(Limit),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Client-error status a connection answers with before closing
    pub fn status(&self) -> Status {
        match self {
            Error::LimitExceeded(limit) => limit.status(),
            Error::InvalidMethod(_) => Status::NOT_IMPLEMENTED,
            Error::InvalidVersion(_) => Status::VERSION_NOT_SUPPORTED,
            Error::Timeout => Status::REQUEST_TIMEOUT,
            _ => Status::BAD_REQUEST,
        }
    }
}

/// A hard ceiling enforced by the request codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    HeaderNameLength,
    HeaderValueLength,
    HeaderCount,
    HeadSize,
    RequestLineLength,
    BodySize,
}

impl Limit {
    /// Get limit name
    pub fn name(&self) -> &'static str {
        match self {
            Limit::HeaderNameLength => "header name length",
            Limit::HeaderValueLength => "header value length",
            Limit::HeaderCount => "header count",
            Limit::HeadSize => "request head size",
            Limit::RequestLineLength => "request line length",
            Limit::BodySize => "body size",
        }
    }

    fn status(&self) -> Status {
        match self {
            Limit::BodySize => Status::PAYLOAD_TOO_LARGE,
            Limit::RequestLineLength => Status::URI_TOO_LONG,
            Limit::HeaderNameLength
            | Limit::HeaderValueLength
            | Limit::HeaderCount
            | Limit::HeadSize => Status::HEADER_FIELDS_TOO_LARGE,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maximum header name length in bytes
pub const MAX_HEADER_NAME_LEN: usize = 256;

/// Maximum header value length in bytes
pub const MAX_HEADER_VALUE_LEN: usize = 8192;

/// Maximum number of headers per request
pub const MAX_HEADERS: usize = 100;

/// Default maximum request body size (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Maximum request line length in bytes
pub const MAX_REQUEST_LINE_LEN: usize = 8192;

/// Maximum size of a request head (request line plus headers)
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
