//! Response streamer
//!
//! Runs the synchronous [`Application`] on a bounded pool of blocking
//! worker threads and hands its output to the connection task as a
//! sequence of [`ResponseEvent`]s over a bounded channel:
//!
//! ```text
//! Head → Chunk* → End
//!      → Chunk { last: true }
//!      ↘ Failed { headers_sent }
//! ```
//!
//! A body known to be complete marks its final chunk `last` so HTTP/2 can
//! set END_STREAM on that DATA frame. Streamed chunks are forwarded as the
//! handler yields them and end with a separate `End`.
//!
//! A full channel blocks the worker, so a slow client throttles the
//! handler instead of growing buffers. The connection decides the wire
//! framing from the head: a `Content-Length` header means fixed length,
//! otherwise chunked (HTTP/1.1) or plain DATA frames (HTTP/2).
//!
//! Handler errors and panics before the head is committed become a
//! generic `500`; after that the connection has to abort the response.

use crate::app::{Application, Body, BoxError, ResponseBody, StartResponse};
use crate::http::{HttpResponse, Request, ResponseHead, Status};
use crate::lifecycle::ShutdownSignal;
use crate::observability::{self, InFlightGauge};
use bytes::Bytes;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// One step of a response, in order
#[derive(Debug)]
pub enum ResponseEvent {
    /// Status and headers; `push` lists paths the handler asked to push
    Head { head: ResponseHead, push: Vec<String> },
    /// Non-empty body bytes; `last` means the body ends here and no
    /// `End` follows
    Chunk { data: Bytes, last: bool },
    /// Body complete
    End,
    /// The handler failed; if headers were sent the response is unusable
    Failed { headers_sent: bool },
}

/// Why a request could not be handed to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("server is shutting down")]
    ShuttingDown,

    #[error("worker pool closed")]
    Closed,
}

/// Bounded pool of blocking application workers
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    channel_capacity: usize,
}

impl WorkerPool {
    pub fn new(size: usize, channel_capacity: usize) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(size)),
            size,
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently running a handler
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Run `app` for `request` on a worker
    ///
    /// Waits for a free worker unless the server terminates first.
    pub async fn dispatch(
        &self,
        app: Arc<dyn Application>,
        request: Request,
        shutdown: &ShutdownSignal,
    ) -> Result<mpsc::Receiver<ResponseEvent>, DispatchError> {
        if shutdown.is_terminated() {
            return Err(DispatchError::ShuttingDown);
        }

        let mut terminated = shutdown.clone();
        let permit = tokio::select! {
            biased;
            _ = terminated.terminated() => return Err(DispatchError::ShuttingDown),
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| DispatchError::Closed)?,
        };

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let emitter = Emitter {
            tx,
            shutdown: shutdown.clone(),
        };

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _in_flight = InFlightGauge::start();
            run(app.as_ref(), &request, &emitter);
        });

        Ok(rx)
    }
}

/// Worker side of the response channel
struct Emitter {
    tx: mpsc::Sender<ResponseEvent>,
    shutdown: ShutdownSignal,
}

impl Emitter {
    /// Blocks while the channel is full; false once nobody is listening
    fn send(&self, event: ResponseEvent) -> bool {
        if self.shutdown.is_terminated() {
            return false;
        }
        self.tx.blocking_send(event).is_ok()
    }

    fn internal_error(&self) {
        let (head, body) =
            HttpResponse::text(Status::INTERNAL_SERVER_ERROR, "Internal Server Error").into_parts();
        let _ = self.send(ResponseEvent::Head { head, push: Vec::new() })
            && self.send(ResponseEvent::Chunk { data: body, last: true });
    }
}

/// Calls `close` exactly once however iteration ends
struct CloseGuard(Box<dyn Body>);

impl CloseGuard {
    fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        match catch_unwind(AssertUnwindSafe(|| self.0.next_chunk())) {
            Ok(chunk) => chunk,
            Err(panic) => Some(Err(panic_message(panic).into())),
        }
    }

    /// Next non-empty chunk
    fn next_data(&mut self) -> Option<Result<Bytes, BoxError>> {
        loop {
            match self.next_chunk() {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                other => return other,
            }
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let body = &mut self.0;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| body.close())) {
            tracing::error!(panic = %panic_message(panic), "response body close hook panicked");
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

fn application_failed(request: &Request, error: &dyn std::fmt::Display) {
    observability::record_error("application");
    tracing::error!(
        method = %request.method(),
        path = request.path(),
        request_id = request.request_id().unwrap_or("-"),
        error = %error,
        "application error"
    );
}

/// Body of one worker invocation
fn run(app: &dyn Application, request: &Request, out: &Emitter) {
    let mut start = StartResponse::new();
    let body = match catch_unwind(AssertUnwindSafe(|| app.call(request, &mut start))) {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            application_failed(request, &e);
            out.internal_error();
            return;
        }
        Err(panic) => {
            application_failed(request, &panic_message(panic));
            out.internal_error();
            return;
        }
    };

    let (head, push) = start.into_parts();
    let Some(mut head) = head else {
        if let ResponseBody::Stream(body) = body {
            drop(CloseGuard(body));
        }
        application_failed(request, &"returned without starting a response");
        out.internal_error();
        return;
    };

    match body {
        ResponseBody::Empty => {
            set_length(&mut head, 0);
            let _ = out.send(ResponseEvent::Head { head, push }) && out.send(ResponseEvent::End);
        }
        ResponseBody::Full(bytes) => {
            set_length(&mut head, bytes.len());
            let _ = out.send(ResponseEvent::Head { head, push })
                && if bytes.is_empty() {
                    out.send(ResponseEvent::End)
                } else {
                    out.send(ResponseEvent::Chunk { data: bytes, last: true })
                };
        }
        ResponseBody::Stream(body) => stream(body, head, push, request, out),
    }
}

/// Fixed-length bodies always carry their exact length
fn set_length(head: &mut ResponseHead, len: usize) {
    if head.status.forbids_body() {
        head.headers.remove("Content-Length");
    } else {
        head.headers.insert("Content-Length", len.to_string());
    }
}

fn stream(body: Box<dyn Body>, mut head: ResponseHead, push: Vec<String>, request: &Request, out: &Emitter) {
    let mut body = CloseGuard(body);

    // The head is not committed until the first chunk exists, so an
    // early failure can still become a clean 500.
    let first = match body.next_data() {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(e)) => {
            application_failed(request, &e);
            out.internal_error();
            return;
        }
        None => None,
    };

    if first.is_none() && !head.headers.contains("Content-Length") {
        set_length(&mut head, 0);
    }
    if !out.send(ResponseEvent::Head { head, push }) {
        return;
    }
    let Some(first) = first else {
        out.send(ResponseEvent::End);
        return;
    };
    if !out.send(ResponseEvent::Chunk { data: first, last: false }) {
        return;
    }

    loop {
        match body.next_data() {
            Some(Ok(chunk)) => {
                if !out.send(ResponseEvent::Chunk { data: chunk, last: false }) {
                    return;
                }
            }
            Some(Err(e)) => {
                application_failed(request, &e);
                out.send(ResponseEvent::Failed { headers_sent: true });
                return;
            }
            None => {
                out.send(ResponseEvent::End);
                return;
            }
        }
    }
}
