//! HTTP/1.1 connection pipeline
//!
//! One [`Http1Connection`] owns a socket for its whole life and walks it
//! through request cycles:
//!
//! ```text
//! AwaitingRequest -> ReadingHeaders -> ReadingBody -> Dispatching
//!     -> WritingResponse -> (AwaitingRequest | Closing)
//! ```
//!
//! Pipelined requests that arrive in one read are queued (up to the
//! configured burst) and answered strictly in arrival order.

use super::chunked::ChunkedEncoder;
use super::parser::ParsePhase;
use super::session::ConnectionInfo;
use super::{Error, HttpResponse, Request, RequestParser, ResponseHead, Result, Status, Version};
use crate::lifecycle::ShutdownSignal;
use crate::observability;
use crate::service::{RequestMeta, Service};
use crate::streamer::ResponseEvent;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Buffered response bytes written out before more body is pulled
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Where a connection is in its request cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    AwaitingRequest,
    ReadingHeaders,
    ReadingBody,
    Dispatching,
    WritingResponse,
    Closing,
}

impl ConnState {
    /// Reading state implied by what the parser has buffered
    fn reading(phase: ParsePhase) -> ConnState {
        match phase {
            ParsePhase::Idle => ConnState::AwaitingRequest,
            ParsePhase::Headers => ConnState::ReadingHeaders,
            ParsePhase::Body => ConnState::ReadingBody,
        }
    }

    /// State once a response has been written
    fn after_response(keep_alive: bool) -> ConnState {
        if keep_alive {
            ConnState::AwaitingRequest
        } else {
            ConnState::Closing
        }
    }
}

/// How a response body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// No body may follow (HEAD, 1xx, 204, 304)
    Suppressed,
    Length(u64),
    Chunked,
    /// HTTP/1.0 without a length: the body ends when the connection does
    CloseDelimited,
}

/// One HTTP/1.1 connection
pub struct Http1Connection<S> {
    io: S,
    info: ConnectionInfo,
    service: Arc<Service>,
    shutdown: ShutdownSignal,
    parser: RequestParser,
    state: ConnState,
    queue: VecDeque<Request>,
    /// Parse error found behind queued requests
    deferred: Option<Error>,
    served: usize,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> Http1Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// `prelude` holds bytes already read while detecting the protocol
    pub fn new(
        io: S,
        prelude: BytesMut,
        info: ConnectionInfo,
        service: Arc<Service>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let mut parser = RequestParser::new(service.limits.parser_limits());
        parser.extend(&prelude);
        Http1Connection {
            io,
            info,
            service,
            shutdown,
            parser,
            state: ConnState::AwaitingRequest,
            queue: VecDeque::new(),
            deferred: None,
            served: 0,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Serve request cycles until the connection closes
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve_requests().await;
        self.state = ConnState::Closing;
        let _ = self.io.shutdown().await;

        match result {
            Err(Error::Io(e)) => {
                debug!(conn = %self.info.id, error = %e, "connection I/O error");
                Ok(())
            }
            other => other,
        }
    }

    async fn serve_requests(&mut self) -> Result<()> {
        loop {
            if self.queue.is_empty() && !self.fill_queue().await? {
                return Ok(());
            }

            while let Some(request) = self.queue.pop_front() {
                let keep_alive = self.serve_one(request).await?;
                self.state = ConnState::after_response(keep_alive);
                if !keep_alive {
                    return Ok(());
                }
            }
        }
    }

    /// Read until at least one request is complete
    ///
    /// Returns false when the connection should close instead.
    async fn fill_queue(&mut self) -> Result<bool> {
        let burst = self.service.limits.pipeline_burst.max(1);
        let timeouts = self.service.timeouts.clone();

        loop {
            if let Some(e) = self.deferred.take() {
                self.reject(&e).await?;
                return Ok(false);
            }
            while self.queue.len() < burst {
                match self.parser.next_request() {
                    Ok(Some(request)) => self.queue.push_back(request),
                    Ok(None) => break,
                    Err(e) if self.queue.is_empty() => {
                        self.reject(&e).await?;
                        return Ok(false);
                    }
                    // Requests queued ahead of the bad one are still answered.
                    Err(e) => {
                        self.deferred = Some(e);
                        break;
                    }
                }
            }
            if !self.queue.is_empty() {
                trace!(conn = %self.info.id, queued = self.queue.len(), "requests ready");
                return Ok(true);
            }

            if self.parser.take_expect_continue() {
                ResponseHead::new(Status::CONTINUE).encode_h1(&mut self.write_buf);
                self.flush().await?;
            }

            self.state = ConnState::reading(self.parser.phase());
            let awaiting = self.state == ConnState::AwaitingRequest;
            if awaiting && self.shutdown.is_draining() {
                return Ok(false);
            }
            let limit = if awaiting {
                timeouts.keep_alive()
            } else {
                timeouts.read()
            };

            let mut draining = self.shutdown.clone();
            let read = tokio::select! {
                biased;
                _ = draining.draining(), if awaiting => return Ok(false),
                read = tokio::time::timeout(limit, self.io.read_buf(&mut self.read_buf)) => read,
            };

            match read {
                Ok(Ok(0)) if awaiting => return Ok(false),
                Ok(Ok(0)) => {
                    debug!(conn = %self.info.id, "connection closed mid-request");
                    self.reject(&Error::Incomplete).await?;
                    return Ok(false);
                }
                Ok(Ok(_)) => {
                    self.parser.extend(&self.read_buf);
                    self.read_buf.clear();
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if awaiting => {
                    debug!(conn = %self.info.id, "keep-alive timeout");
                    return Ok(false);
                }
                Err(_) => {
                    self.reject(&Error::Timeout).await?;
                    return Ok(false);
                }
            }
        }
    }

    /// Dispatch one request and write its response; returns keep-alive
    async fn serve_one(&mut self, mut request: Request) -> Result<bool> {
        self.state = ConnState::Dispatching;
        request.set_scheme(self.info.scheme());
        let meta = self.service.prepare(&mut request, self.info.peer);
        self.served += 1;

        let keep_alive = meta.keep_alive
            && self.served < self.service.limits.max_requests_per_connection
            && !self.shutdown.is_draining();

        let events = self.service.respond(request, &self.shutdown).await;
        self.state = ConnState::WritingResponse;
        self.write_response(&meta, events, keep_alive).await
    }

    async fn write_response(
        &mut self,
        meta: &RequestMeta,
        mut events: mpsc::Receiver<ResponseEvent>,
        mut keep_alive: bool,
    ) -> Result<bool> {
        let mut status = 0;
        let mut framing = None;
        let mut written: u64 = 0;

        loop {
            let event = events.recv().await.unwrap_or(ResponseEvent::Failed {
                headers_sent: framing.is_some(),
            });

            match event {
                ResponseEvent::Head { mut head, .. } => {
                    meta.decorate(&mut head);
                    status = head.status.code();
                    let chosen = choose_framing(&mut head, meta, &mut keep_alive);
                    framing = Some(chosen);
                    head.encode_h1(&mut self.write_buf);

                    if chosen == Framing::Suppressed {
                        // Dropping the receiver stops the worker and closes the body.
                        break;
                    }
                }
                ResponseEvent::Chunk { data, last } => {
                    match framing {
                        Some(Framing::Length(len)) => {
                            let room = len.saturating_sub(written);
                            if data.len() as u64 > room {
                                warn!(
                                    request_id = %meta.request_id,
                                    declared = len,
                                    "response body longer than Content-Length"
                                );
                                self.write_buf.extend_from_slice(&data[..room as usize]);
                                written += room;
                                keep_alive = false;
                                break;
                            }
                            self.write_buf.extend_from_slice(&data);
                        }
                        Some(Framing::Chunked) => {
                            ChunkedEncoder::new(&mut self.write_buf).write_chunk(&data);
                        }
                        Some(Framing::CloseDelimited) => self.write_buf.extend_from_slice(&data),
                        Some(Framing::Suppressed) | None => continue,
                    }
                    written += data.len() as u64;
                    if last {
                        self.end_body(meta, framing, written, &mut keep_alive);
                        break;
                    }
                    if self.write_buf.len() >= FLUSH_THRESHOLD {
                        self.flush().await?;
                    }
                }
                ResponseEvent::End => {
                    self.end_body(meta, framing, written, &mut keep_alive);
                    break;
                }
                ResponseEvent::Failed { .. } => {
                    observability::record_error("response");
                    if framing.is_none() {
                        let response = HttpResponse::builder()
                            .status(Status::INTERNAL_SERVER_ERROR)
                            .header("Content-Type", "text/plain; charset=utf-8")
                            .header("Connection", "close")
                            .body(Status::INTERNAL_SERVER_ERROR.reason_phrase())
                            .build();
                        status = 500;
                        self.write_buf
                            .extend_from_slice(&response.to_wire(!meta.is_head()));
                    } else {
                        // Headers are out; a truncated body is all the
                        // client can be told.
                        warn!(request_id = %meta.request_id, "aborting connection mid-response");
                    }
                    keep_alive = false;
                    break;
                }
            }
        }

        self.flush().await?;
        meta.log_access(status, written, meta.version.as_str());
        Ok(keep_alive)
    }

    /// Close out the body framing once the last byte has been queued
    fn end_body(
        &mut self,
        meta: &RequestMeta,
        framing: Option<Framing>,
        written: u64,
        keep_alive: &mut bool,
    ) {
        match framing {
            Some(Framing::Chunked) => ChunkedEncoder::new(&mut self.write_buf).finish(),
            Some(Framing::Length(len)) if written != len => {
                warn!(
                    request_id = %meta.request_id,
                    declared = len,
                    sent = written,
                    "response body shorter than Content-Length"
                );
                *keep_alive = false;
            }
            _ => {}
        }
    }

    /// Answer a request that could not be parsed, then close
    async fn reject(&mut self, error: &Error) -> Result<()> {
        let status = error.status();
        debug!(conn = %self.info.id, peer = %self.info.peer, error = %error, status = status.code(), "rejecting request");
        observability::record_error("parse");

        let response = HttpResponse::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("Connection", "close")
            .body(status.reason_phrase())
            .build();
        self.write_buf.extend_from_slice(&response.to_wire(true));
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let limit = self.service.timeouts.write();
        let write = async {
            self.io.write_all(&self.write_buf).await?;
            self.io.flush().await
        };
        match tokio::time::timeout(limit, write).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        }
        self.write_buf.clear();
        Ok(())
    }
}

/// Decide the body framing and add the headers that announce it
fn choose_framing(head: &mut ResponseHead, meta: &RequestMeta, keep_alive: &mut bool) -> Framing {
    if head.headers.has_token("Connection", "close") {
        *keep_alive = false;
    }

    let declared = match head.headers.content_length() {
        Ok(len) => len,
        Err(_) => {
            head.headers.remove("Content-Length");
            None
        }
    };

    let framing = if head.status.forbids_body() {
        head.headers.remove("Transfer-Encoding");
        Framing::Suppressed
    } else if let Some(len) = declared {
        head.headers.remove("Transfer-Encoding");
        Framing::Length(len)
    } else if meta.version == Version::Http10 {
        head.headers.remove("Transfer-Encoding");
        *keep_alive = false;
        Framing::CloseDelimited
    } else {
        head.headers.insert("Transfer-Encoding", "chunked");
        Framing::Chunked
    };

    if !*keep_alive {
        head.headers.insert("Connection", "close");
    } else if meta.version == Version::Http10 {
        head.headers.insert("Connection", "keep-alive");
    }

    // HEAD keeps the headers a GET would produce but never a body.
    if meta.is_head() {
        Framing::Suppressed
    } else {
        framing
    }
}

/// Serve one HTTP/1.1 connection until it closes
pub async fn serve<S>(
    io: S,
    prelude: BytesMut,
    info: ConnectionInfo,
    service: Arc<Service>,
    shutdown: ShutdownSignal,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Http1Connection::new(io, prelude, info, service, shutdown).run().await
}
