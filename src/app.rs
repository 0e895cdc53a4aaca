//! Application contract
//!
//! An [`Application`] is a synchronous callable invoked once per request.
//! It announces status and headers through [`StartResponse`] and returns a
//! [`ResponseBody`]: nothing, a complete buffer, or a lazy sequence of
//! chunks. Streamed bodies get their [`Body::close`] hook called exactly
//! once when the server stops iterating them, however that happens.
//!
//! ```
//! use appserver::app::{ResponseBody, StartResponse};
//! use appserver::http::Request;
//!
//! fn hello(_req: &Request, res: &mut StartResponse) -> Result<ResponseBody, appserver::BoxError> {
//!     res.start("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
//!     Ok(ResponseBody::from("Hello, world!"))
//! }
//! ```

use crate::http::{Headers, Request, ResponseHead, Status};
use bytes::Bytes;
use std::fmt;

/// Error type handlers may fail with
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Misuse of the response-initiation function
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("response already started")]
    AlreadyStarted,

    #[error("invalid status line: {0}")]
    InvalidStatus(String),

    #[error("invalid response header: {0}")]
    InvalidHeader(String),
}

/// A request handler
///
/// Runs on a blocking worker thread, never on the I/O runtime, so it may
/// block freely.
pub trait Application: Send + Sync + 'static {
    fn call(&self, request: &Request, response: &mut StartResponse) -> Result<ResponseBody, BoxError>;
}

impl<F> Application for F
where
    F: Fn(&Request, &mut StartResponse) -> Result<ResponseBody, BoxError> + Send + Sync + 'static,
{
    fn call(&self, request: &Request, response: &mut StartResponse) -> Result<ResponseBody, BoxError> {
        self(request, response)
    }
}

/// Response-initiation function handed to the application
///
/// The first successful [`start`](Self::start) freezes status and headers.
#[derive(Debug, Default)]
pub struct StartResponse {
    head: Option<ResponseHead>,
    push: Vec<String>,
}

impl StartResponse {
    pub fn new() -> Self {
        StartResponse::default()
    }

    /// Set status line (`"200 OK"`) and headers
    ///
    /// A second call is a usage error; see
    /// [`start_with_error`](Self::start_with_error) for replacing a head.
    pub fn start(&mut self, status_line: &str, headers: Vec<(String, String)>) -> Result<(), StartError> {
        if self.head.is_some() {
            return Err(StartError::AlreadyStarted);
        }
        self.head = Some(build_head(status_line, headers)?);
        Ok(())
    }

    /// Replace the pending head after the handler hit an error
    ///
    /// Allowed any number of times while nothing has been written. The
    /// error is logged; it never reaches the client.
    pub fn start_with_error(
        &mut self,
        status_line: &str,
        headers: Vec<(String, String)>,
        error: BoxError,
    ) -> Result<(), StartError> {
        tracing::warn!(error = %error, status = status_line, "application replaced response head");
        self.head = Some(build_head(status_line, headers)?);
        Ok(())
    }

    /// Ask the server to push `path` alongside this response
    ///
    /// Honoured only on HTTP/2 connections whose client accepts push.
    pub fn push(&mut self, path: impl Into<String>) {
        self.push.push(path.into());
    }

    pub fn is_started(&self) -> bool {
        self.head.is_some()
    }

    pub fn status(&self) -> Option<Status> {
        self.head.as_ref().map(|head| head.status)
    }

    pub(crate) fn into_parts(self) -> (Option<ResponseHead>, Vec<String>) {
        (self.head, self.push)
    }
}

fn build_head(status_line: &str, headers: Vec<(String, String)>) -> Result<ResponseHead, StartError> {
    let (status, reason) =
        Status::parse_line(status_line).map_err(|e| StartError::InvalidStatus(e.to_string()))?;

    let mut validated = Headers::new();
    for (name, value) in headers {
        Headers::validate_field(&name, &value).map_err(|e| StartError::InvalidHeader(e.to_string()))?;
        validated.append(name, value);
    }

    Ok(ResponseHead {
        status,
        reason,
        headers: validated,
    })
}

/// A lazily produced response body
pub trait Body: Send {
    /// Next chunk, or None once exhausted
    fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>>;

    /// Release resources held by the body
    fn close(&mut self) {}
}

/// [`Body`] over an iterator of fallible chunks
pub struct IterBody<I> {
    iter: I,
}

impl<I> IterBody<I> {
    pub fn new(iter: I) -> Self {
        IterBody { iter }
    }
}

impl<I> Body for IterBody<I>
where
    I: Iterator<Item = Result<Bytes, BoxError>> + Send,
{
    fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        self.iter.next()
    }
}

/// What an application returns
pub enum ResponseBody {
    Empty,
    /// Complete body; sent with Content-Length
    Full(Bytes),
    /// Chunks pulled one by one; sent chunked unless a Content-Length was set
    Stream(Box<dyn Body>),
}

impl ResponseBody {
    pub fn full(data: impl Into<Bytes>) -> Self {
        ResponseBody::Full(data.into())
    }

    pub fn stream(body: impl Body + 'static) -> Self {
        ResponseBody::Stream(Box::new(body))
    }

    /// Stream infallible chunks from an iterator
    pub fn from_iter<I, T>(chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Into<Bytes>,
    {
        Self::stream(IterBody::new(chunks.into_iter().map(|chunk| Ok(chunk.into()))))
    }

    /// Stream fallible chunks from an iterator
    pub fn try_from_iter<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Result<Bytes, BoxError>>,
        I::IntoIter: Send + 'static,
    {
        Self::stream(IterBody::new(chunks.into_iter()))
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<&'static str> for ResponseBody {
    fn from(s: &'static str) -> Self {
        ResponseBody::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for ResponseBody {
    fn from(s: String) -> Self {
        ResponseBody::Full(Bytes::from(s))
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(v: Vec<u8>) -> Self {
        ResponseBody::Full(Bytes::from(v))
    }
}

impl From<Bytes> for ResponseBody {
    fn from(b: Bytes) -> Self {
        ResponseBody::Full(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_freezes_head() {
        let mut res = StartResponse::new();
        res.start("200 OK", vec![("X-A".into(), "1".into())]).unwrap();

        assert!(matches!(
            res.start("404 Not Found", vec![]),
            Err(StartError::AlreadyStarted)
        ));
        assert_eq!(res.status(), Some(Status::OK));
    }

    #[test]
    fn test_start_with_error_replaces_head() {
        let mut res = StartResponse::new();
        res.start("200 OK", vec![]).unwrap();
        res.start_with_error("500 Internal Server Error", vec![], "boom".into())
            .unwrap();

        let (head, _) = res.into_parts();
        assert_eq!(head.unwrap().status, Status::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_invalid_status_and_header_rejected() {
        let mut res = StartResponse::new();
        assert!(matches!(res.start("OK", vec![]), Err(StartError::InvalidStatus(_))));
        assert!(matches!(
            res.start("200 OK", vec![("X-Bad".into(), "a\r\nb".into())]),
            Err(StartError::InvalidHeader(_))
        ));
        assert!(!res.is_started());
    }

    #[test]
    fn test_custom_reason_phrase_kept() {
        let mut res = StartResponse::new();
        res.start("299 Custom Thing", vec![]).unwrap();
        let (head, _) = res.into_parts();
        let head = head.unwrap();
        assert_eq!(head.status.code(), 299);
        assert_eq!(head.reason, "Custom Thing");
    }

    #[test]
    fn test_push_paths_recorded() {
        let mut res = StartResponse::new();
        res.push("/style.css");
        let (_, push) = res.into_parts();
        assert_eq!(push, vec!["/style.css".to_string()]);
    }

    #[test]
    fn test_closure_is_application() {
        let app = |_req: &Request, res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
            res.start("204 No Content", vec![])?;
            Ok(ResponseBody::Empty)
        };
        let request = Request::builder().build();
        let mut res = StartResponse::new();
        assert!(matches!(app.call(&request, &mut res).unwrap(), ResponseBody::Empty));
        assert_eq!(res.status(), Some(Status::NO_CONTENT));
    }

    #[test]
    fn test_iter_body_yields_in_order() {
        let ResponseBody::Stream(mut body) = ResponseBody::from_iter(vec!["a", "b"]) else {
            panic!("expected stream");
        };
        assert_eq!(body.next_chunk().unwrap().unwrap(), Bytes::from("a"));
        assert_eq!(body.next_chunk().unwrap().unwrap(), Bytes::from("b"));
        assert!(body.next_chunk().is_none());
    }
}
