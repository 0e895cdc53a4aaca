//! HTTP/1.1 request codec
//!
//! `RequestParser` accumulates bytes until a complete request head is seen,
//! validates it against [`ParserLimits`] and then collects the body declared
//! by `Content-Length` or `Transfer-Encoding: chunked`. Several pipelined
//! requests may sit in the buffer at once; they are returned one at a time
//! in arrival order.
//!
//! Any violation is returned as an error naming the problem. The parser is
//! not meant to be reused after an error: the connection answers with a
//! client-error status and closes.

use super::chunked::{find_crlf, ChunkedDecoder};
use super::{
    Error, Headers, Limit, Method, Request, Result, Version, DEFAULT_MAX_BODY_SIZE, MAX_HEADERS,
    MAX_HEADER_NAME_LEN, MAX_HEADER_VALUE_LEN, MAX_HEAD_SIZE, MAX_REQUEST_LINE_LEN,
};
use bytes::{Buf, Bytes, BytesMut};

/// Hard ceilings enforced while parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserLimits {
    pub max_header_name_len: usize,
    pub max_header_value_len: usize,
    pub max_headers: usize,
    pub max_body_size: usize,
    pub max_request_line_len: usize,
    pub max_head_size: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        ParserLimits {
            max_header_name_len: MAX_HEADER_NAME_LEN,
            max_header_value_len: MAX_HEADER_VALUE_LEN,
            max_headers: MAX_HEADERS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_request_line_len: MAX_REQUEST_LINE_LEN,
            max_head_size: MAX_HEAD_SIZE,
        }
    }
}

/// Which part of a request the parser is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    /// Nothing buffered; waiting for the first byte of a request
    Idle,
    /// Part of a request head is buffered
    Headers,
    /// The head is complete and body bytes are outstanding
    Body,
}

/// Parse HTTP request line
///
/// Format: METHOD SP request-target SP VERSION
/// Example: GET /index.html HTTP/1.1
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split(' ').collect();

    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::Parse(format!(
            "Invalid request line: expected 3 parts, got {}",
            parts.len()
        )));
    }

    let method = Method::from_str(parts[0])?;
    let target = parts[1];
    let version = Version::from_str(parts[2])?;

    let valid_target = match method {
        Method::Connect => true,
        Method::Options if target == "*" => true,
        _ => target.starts_with('/') || target.contains("://"),
    };
    if !valid_target || target.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(Error::Parse(format!("Invalid request target: {}", target)));
    }

    Ok((method, target.to_string(), version))
}

#[derive(Debug)]
struct RequestHead {
    method: Method,
    target: String,
    version: Version,
    headers: Headers,
    expect_continue: bool,
}

impl RequestHead {
    fn into_request(self, body: Bytes) -> Request {
        Request::builder()
            .method(self.method)
            .target(self.target)
            .version(self.version)
            .headers(self.headers)
            .body(body)
            .build()
    }
}

#[derive(Debug)]
enum ParserState {
    Head,
    Body {
        head: RequestHead,
        length: usize,
    },
    Chunked {
        head: RequestHead,
        decoder: ChunkedDecoder,
        body: BytesMut,
    },
}

/// HTTP/1.1 request parser
#[derive(Debug)]
pub struct RequestParser {
    limits: ParserLimits,
    buffer: BytesMut,
    state: ParserState,
    expect_continue: bool,
}

impl RequestParser {
    /// Create a new request parser
    pub fn new(limits: ParserLimits) -> Self {
        RequestParser {
            limits,
            buffer: BytesMut::with_capacity(8192),
            state: ParserState::Head,
            expect_continue: false,
        }
    }

    /// Append raw bytes read from the connection
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Append bytes and return every request they complete
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Request>> {
        self.extend(data);
        let mut requests = Vec::new();
        while let Some(request) = self.next_request()? {
            requests.push(request);
        }
        Ok(requests)
    }

    /// Current parse phase
    pub fn phase(&self) -> ParsePhase {
        match self.state {
            ParserState::Head if self.buffer.iter().all(|&b| b == b'\r' || b == b'\n') => {
                ParsePhase::Idle
            }
            ParserState::Head => ParsePhase::Headers,
            _ => ParsePhase::Body,
        }
    }

    /// Whether a `100 Continue` interim response is owed to the client
    ///
    /// Returns true at most once per request.
    pub fn take_expect_continue(&mut self) -> bool {
        std::mem::take(&mut self.expect_continue)
    }

    /// Parse the next complete request out of the buffer
    ///
    /// Returns Ok(Some(request)) when a complete request is parsed,
    /// Ok(None) if more data is needed, or Err on parse error.
    pub fn next_request(&mut self) -> Result<Option<Request>> {
        loop {
            match &mut self.state {
                ParserState::Head => {
                    if !self.parse_head()? {
                        return Ok(None);
                    }
                }
                ParserState::Body { length, head } => {
                    if self.buffer.len() < *length {
                        if std::mem::take(&mut head.expect_continue) {
                            self.expect_continue = true;
                        }
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(*length).freeze();
                    return Ok(Some(self.finish(body)));
                }
                ParserState::Chunked {
                    head,
                    decoder,
                    body,
                } => {
                    let (consumed, complete) = decoder.decode(&self.buffer, body)?;
                    self.buffer.advance(consumed);
                    if body.len() > self.limits.max_body_size {
                        return Err(Error::LimitExceeded(Limit::BodySize));
                    }
                    if !complete {
                        if std::mem::take(&mut head.expect_continue) {
                            self.expect_continue = true;
                        }
                        return Ok(None);
                    }
                    let body = std::mem::take(body).freeze();
                    return Ok(Some(self.finish(body)));
                }
            }
        }
    }

    fn finish(&mut self, body: Bytes) -> Request {
        match std::mem::replace(&mut self.state, ParserState::Head) {
            ParserState::Body { head, .. } | ParserState::Chunked { head, .. } => {
                head.into_request(body)
            }
            // next_request only calls finish from a body state.
            ParserState::Head => Request::builder().body(body).build(),
        }
    }

    /// Try to parse a request head; returns false if more data is needed
    ///
    /// On success the parser moves into a body state; requests without a
    /// body get a zero-length `Body` state.
    fn parse_head(&mut self) -> Result<bool> {
        // Tolerate empty lines between pipelined requests.
        while self.buffer.starts_with(b"\r\n") {
            self.buffer.advance(2);
        }

        let Some(head_end) = find_head_end(&self.buffer) else {
            if find_crlf(&self.buffer).is_none()
                && self.buffer.len() > self.limits.max_request_line_len
            {
                return Err(Error::LimitExceeded(Limit::RequestLineLength));
            }
            if self.buffer.len() > self.limits.max_head_size {
                return Err(Error::LimitExceeded(Limit::HeadSize));
            }
            return Ok(false);
        };

        if head_end > self.limits.max_head_size {
            return Err(Error::LimitExceeded(Limit::HeadSize));
        }

        let raw = self.buffer.split_to(head_end + 4);
        let head = self.parse_head_block(&raw[..head_end])?;

        if let Some(coding) = head.headers.get("Transfer-Encoding") {
            if head.headers.contains("Content-Length") {
                return Err(Error::Protocol(
                    "Both Transfer-Encoding and Content-Length present".to_string(),
                ));
            }
            let last = coding.rsplit(',').next().unwrap_or_default().trim();
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(Error::InvalidHeader(format!(
                    "Unsupported transfer coding: {}",
                    coding
                )));
            }
            self.state = ParserState::Chunked {
                head,
                decoder: ChunkedDecoder::with_max_trailers(self.limits.max_headers),
                body: BytesMut::new(),
            };
            return Ok(true);
        }

        let length = match head.headers.content_length()? {
            Some(length) if length > self.limits.max_body_size as u64 => {
                return Err(Error::LimitExceeded(Limit::BodySize));
            }
            Some(length) => length as usize,
            None => 0,
        };

        self.state = ParserState::Body { head, length };
        Ok(true)
    }

    fn parse_head_block(&self, block: &[u8]) -> Result<RequestHead> {
        let (line, mut rest) = match find_crlf(block) {
            Some(pos) => (&block[..pos], &block[pos + 2..]),
            None => (block, &block[block.len()..]),
        };

        if line.len() > self.limits.max_request_line_len {
            return Err(Error::LimitExceeded(Limit::RequestLineLength));
        }
        if !line.is_ascii() || line.iter().any(|&b| b == b'\r' || b == b'\n') {
            return Err(Error::Parse("Malformed request line".to_string()));
        }
        let line = std::str::from_utf8(line)
            .map_err(|_| Error::Parse("Malformed request line".to_string()))?;
        let (method, target, version) = parse_request_line(line)?;

        let mut headers = Headers::new();
        let mut count = 0;
        while !rest.is_empty() {
            let (field, next) = match find_crlf(rest) {
                Some(pos) => (&rest[..pos], &rest[pos + 2..]),
                None => (rest, &rest[rest.len()..]),
            };
            rest = next;

            count += 1;
            if count > self.limits.max_headers {
                return Err(Error::LimitExceeded(Limit::HeaderCount));
            }

            if let Some(colon) = field.iter().position(|&b| b == b':') {
                if colon > self.limits.max_header_name_len {
                    return Err(Error::LimitExceeded(Limit::HeaderNameLength));
                }
            }
            let (name, value) = Headers::parse_header_line(field)?;
            if value.len() > self.limits.max_header_value_len {
                return Err(Error::LimitExceeded(Limit::HeaderValueLength));
            }
            headers.combine(name, value);
        }

        if version == Version::Http11 && !headers.contains("Host") {
            return Err(Error::InvalidHeader("Missing Host header".to_string()));
        }

        let expect_continue = version == Version::Http11
            && headers
                .get("Expect")
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

        Ok(RequestHead {
            method,
            target,
            version,
            headers,
            expect_continue,
        })
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new(ParserLimits::default())
    }
}

/// Position of the blank line that ends a request head
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
