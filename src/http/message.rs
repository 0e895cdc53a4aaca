//! HTTP message types
//!
//! This module defines the request record handed to applications, the
//! response head an application produces and a fully materialized
//! response used for replies the server generates itself.

use super::{Error, Headers, Result, CRLF};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Parse method from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }

    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
    H2,
}

impl Version {
    /// Parse an HTTP/1.x version from a request line
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }

    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::H2 => "HTTP/2",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Parse an application status line such as `"404 Not Found"`
    ///
    /// Returns the status and the reason phrase exactly as given; a bare
    /// code gets its canonical phrase.
    pub fn parse_line(line: &str) -> Result<(Status, String)> {
        let line = line.trim_start();
        let (code, reason) = match line.split_once(' ') {
            Some((code, reason)) => (code, reason.trim()),
            None => (line, ""),
        };

        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidStatus(format!("Invalid status line: {}", line)));
        }
        let code = code
            .parse::<u16>()
            .map_err(|_| Error::InvalidStatus(format!("Invalid status line: {}", line)))?;
        let status = Status::new(code)?;

        if reason.bytes().any(|b| b == b'\r' || b == b'\n') || !reason.is_ascii() {
            return Err(Error::InvalidStatus("Invalid reason phrase".to_string()));
        }

        let reason = if reason.is_empty() {
            status.reason_phrase().to_string()
        } else {
            reason.to_string()
        };
        Ok((status, reason))
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            417 => "Expectation Failed",
            426 => "Upgrade Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }

    /// Check if this is an informational status (1xx)
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Responses with this status never carry a body
    pub fn forbids_body(&self) -> bool {
        self.is_informational() || self.code == 204 || self.code == 304
    }

    pub const CONTINUE: Status = Status { code: 100 };
    pub const OK: Status = Status { code: 200 };
    pub const NO_CONTENT: Status = Status { code: 204 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const FORBIDDEN: Status = Status { code: 403 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const REQUEST_TIMEOUT: Status = Status { code: 408 };
    pub const PAYLOAD_TOO_LARGE: Status = Status { code: 413 };
    pub const URI_TOO_LONG: Status = Status { code: 414 };
    pub const TOO_MANY_REQUESTS: Status = Status { code: 429 };
    pub const HEADER_FIELDS_TOO_LARGE: Status = Status { code: 431 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
    pub const NOT_IMPLEMENTED: Status = Status { code: 501 };
    pub const SERVICE_UNAVAILABLE: Status = Status { code: 503 };
    pub const VERSION_NOT_SUPPORTED: Status = Status { code: 505 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// Split a request target into path and query string
///
/// Absolute-form targets (`http://host/path`) are reduced to their path.
pub fn split_target(target: &str) -> (String, String) {
    let origin_form = match target.find("://") {
        Some(scheme_end) => {
            let rest = &target[scheme_end + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => target,
    };

    match origin_form.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (origin_form.to_string(), String::new()),
    }
}

/// A parsed request handed to the application
///
/// Built once per request cycle and immutable from the application's
/// point of view.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    path: String,
    query: String,
    version: Version,
    headers: Headers,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    scheme: &'static str,
}

impl Request {
    /// Create a builder for constructing requests
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Get the request method
    pub fn method(&self) -> Method {
        self.method
    }

    /// Get the raw request target
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get the path component of the target
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the query string (without `?`)
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get the body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Peer address of the connection that carried the request
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// `http` or `https`
    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    /// Request id assigned by the server or supplied by the client
    pub fn request_id(&self) -> Option<&str> {
        self.headers.get("X-Request-ID")
    }

    /// Whether the client asked to keep the connection open
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is sent.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
            Version::Http11 | Version::H2 => !self.headers.has_token("Connection", "close"),
        }
    }

    pub(crate) fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub(crate) fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub(crate) fn set_scheme(&mut self, scheme: &'static str) {
        self.scheme = scheme;
    }
}

/// Builder for requests
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    target: Option<String>,
    version: Option<Version>,
    headers: Headers,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    scheme: Option<&'static str>,
}

impl RequestBuilder {
    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set the request target
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the HTTP version
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Add a header with request-side duplicate semantics
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.combine(name, value);
        self
    }

    /// Replace all headers
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the peer address
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set the scheme
    pub fn scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = Some(scheme);
        self
    }

    /// Build the request
    pub fn build(self) -> Request {
        let target = self.target.unwrap_or_else(|| "/".to_string());
        let (path, query) = split_target(&target);
        Request {
            method: self.method.unwrap_or(Method::Get),
            target,
            path,
            query,
            version: self.version.unwrap_or_default(),
            headers: self.headers,
            body: self.body,
            remote_addr: self.remote_addr,
            scheme: self.scheme.unwrap_or("http"),
        }
    }
}

/// Status line and headers of a response
///
/// Once handed to a connection the head is frozen; the body follows
/// separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: Status,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Create a head with the canonical reason phrase
    pub fn new(status: Status) -> Self {
        ResponseHead {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::new(),
        }
    }

    /// Serialize the status line and headers for HTTP/1.1
    pub fn encode_h1(&self, dst: &mut BytesMut) {
        dst.put_slice(Version::Http11.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.status.code().to_string().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.reason.as_bytes());
        dst.put_slice(CRLF.as_bytes());

        for (name, value) in self.headers.iter() {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(CRLF.as_bytes());
        }

        dst.put_slice(CRLF.as_bytes());
    }
}

/// Fully materialized response generated by the server itself
#[derive(Debug, Clone)]
pub struct HttpResponse {
    head: ResponseHead,
    body: Bytes,
}

impl HttpResponse {
    /// Create a builder for constructing responses
    pub fn builder() -> HttpResponseBuilder {
        HttpResponseBuilder::default()
    }

    /// Plain-text response with `Content-Length` set
    pub fn text(status: Status, body: &'static str) -> Self {
        HttpResponse::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(Bytes::from_static(body.as_bytes()))
            .build()
    }

    /// Get the status code
    pub fn status(&self) -> Status {
        self.head.status
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// Get mutable headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.head.headers
    }

    /// Get the body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Split into head and body
    pub fn into_parts(self) -> (ResponseHead, Bytes) {
        (self.head, self.body)
    }

    /// Convert the response to HTTP/1.1 wire format
    ///
    /// The body is omitted when `include_body` is false (HEAD requests).
    pub fn to_wire(&self, include_body: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        self.head.encode_h1(&mut buf);
        if include_body {
            buf.put_slice(&self.body);
        }
        buf.freeze()
    }
}

/// Builder for responses
#[derive(Debug, Default)]
pub struct HttpResponseBuilder {
    status: Option<Status>,
    reason: Option<String>,
    headers: Headers,
    body: Bytes,
}

impl HttpResponseBuilder {
    /// Set the status code
    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the reason phrase
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Build the response, setting `Content-Length` from the body
    pub fn build(mut self) -> HttpResponse {
        let status = self.status.unwrap_or(Status::OK);
        let reason = self.reason.unwrap_or_else(|| status.reason_phrase().to_string());
        if !status.forbids_body() {
            self.headers.insert("Content-Length", self.body.len().to_string());
        }
        HttpResponse {
            head: ResponseHead {
                status,
                reason,
                headers: self.headers,
            },
            body: self.body,
        }
    }
}
