//! HTTP/2 server connection
//!
//! [`H2Connection`] is a sans-IO state machine: bytes go in through
//! [`H2Connection::receive`], frames to write accumulate in an output
//! buffer, and complete requests come back as [`Event`]s. [`serve`] drives
//! one connection over a socket, running each stream's response on the
//! worker pool and interleaving their DATA under flow control.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControlWindow;
use super::frames::*;
use super::settings::Settings;
use super::stream::{StreamEvent, StreamId, StreamManager, StreamState};
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID};
use crate::http::session::ConnectionInfo;
use crate::http::{Headers, HttpResponse, Method, Request, ResponseHead, Status, Version};
use crate::lifecycle::ShutdownSignal;
use crate::observability;
use crate::service::{RequestMeta, Service};
use crate::streamer::ResponseEvent;
use bytes::{Bytes, BytesMut};
use hpack::Encoder as HpackEncoder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Response DATA buffered behind flow control before the driver stops
/// pulling more from the workers
pub const MAX_PENDING_DATA: usize = 1024 * 1024;

/// Upper bound on a header block assembled from CONTINUATION frames
const MAX_HEADER_BLOCK: usize = 256 * 1024;

/// Headers that only make sense on an HTTP/1.1 connection
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Something the connection wants the caller to act on
#[derive(Debug)]
pub enum Event {
    /// A request is complete and ready to be answered
    Request { stream_id: StreamId, request: Request },
    /// The peer cancelled a stream
    StreamReset { stream_id: StreamId, code: ErrorCode },
    /// The peer is shutting the connection down
    GoAway { last_stream_id: StreamId, code: ErrorCode },
}

/// Header block spread over HEADERS and CONTINUATION frames
#[derive(Debug)]
struct HeaderBlock {
    stream_id: StreamId,
    end_stream: bool,
    block: BytesMut,
}

/// Validated request head of one stream
#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    headers: Headers,
    content_length: Option<usize>,
}

/// Server side of one HTTP/2 connection
pub struct H2Connection {
    local: Settings,
    remote: Settings,
    codec: FrameCodec,
    encoder: HpackEncoder<'static>,
    decoder: hpack::Decoder<'static>,
    streams: StreamManager,
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
    output: BytesMut,
    continuation: Option<HeaderBlock>,
    preface_received: bool,
    goaway_sent: bool,
    peer_goaway: bool,
    failed: bool,
    max_body_size: usize,
    scheme: &'static str,
}

impl H2Connection {
    pub fn new(local: Settings, max_body_size: usize, scheme: &'static str) -> Self {
        let max_streams = local.max_concurrent_streams.unwrap_or(u32::MAX);
        H2Connection {
            codec: FrameCodec::new(local.max_frame_size),
            // The connection window is fixed at the protocol default; only
            // stream windows follow INITIAL_WINDOW_SIZE.
            recv_window: FlowControlWindow::new(),
            send_window: FlowControlWindow::new(),
            local,
            remote: Settings::default(),
            encoder: HpackEncoder::new(),
            decoder: hpack::Decoder::new(),
            streams: StreamManager::new(max_streams),
            output: BytesMut::with_capacity(16 * 1024),
            continuation: None,
            preface_received: false,
            goaway_sent: false,
            peer_goaway: false,
            failed: false,
            max_body_size,
            scheme,
        }
    }

    /// Queue the server's SETTINGS frame
    pub fn start(&mut self) {
        let settings = SettingsFrame::new(self.local.server_params());
        FrameCodec::encode_settings_frame(&settings, &mut self.output);
    }

    /// Feed bytes read from the peer
    pub fn receive(&mut self, data: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        if self.failed {
            return events;
        }
        self.codec.extend(data);

        if !self.preface_received {
            let Some(preface) = self.codec.take_raw(CONNECTION_PREFACE.len()) else {
                return events;
            };
            if &preface[..] != CONNECTION_PREFACE {
                self.connection_error(Error::Protocol("invalid connection preface".to_string()));
                return events;
            }
            self.preface_received = true;
        }

        loop {
            let frame = match self.codec.decode() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.connection_error(e);
                    break;
                }
            };
            trace!(kind = frame.kind, stream_id = frame.stream_id, len = frame.payload_len(), "h2 frame");

            if let Err(e) = self.handle_frame(frame, &mut events) {
                match e.stream_id() {
                    Some(stream_id) => {
                        debug!(stream_id, error = %e, "h2 stream error");
                        let code = e.code();
                        self.reset_stream(stream_id, code);
                        events.push(Event::StreamReset { stream_id, code });
                    }
                    None => {
                        self.connection_error(e);
                        break;
                    }
                }
            }
        }

        self.streams.cleanup_closed();
        events
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        let kind = frame.frame_type();

        if let Some(pending) = &self.continuation {
            if kind != Some(FrameType::Continuation) || frame.stream_id != pending.stream_id {
                return Err(Error::Protocol("expected CONTINUATION".to_string()));
            }
        }

        match kind {
            Some(FrameType::Data) => self.on_data(&frame, events),
            Some(FrameType::Headers) => self.on_headers(&frame, events),
            Some(FrameType::Continuation) => self.on_continuation(&frame, events),
            Some(FrameType::Priority) => PriorityFrame::parse(&frame).map(|_| ()),
            Some(FrameType::RstStream) => self.on_rst_stream(&frame, events),
            Some(FrameType::Settings) => self.on_settings(&frame),
            Some(FrameType::PushPromise) => {
                Err(Error::Protocol("client sent PUSH_PROMISE".to_string()))
            }
            Some(FrameType::Ping) => self.on_ping(&frame),
            Some(FrameType::Goaway) => self.on_goaway(&frame, events),
            Some(FrameType::WindowUpdate) => self.on_window_update(&frame),
            // Unknown frame types are ignored.
            None => Ok(()),
        }
    }

    fn on_data(&mut self, frame: &Frame, events: &mut Vec<Event>) -> Result<()> {
        let data = DataFrame::parse(frame)?;
        let id = data.stream_id;

        self.recv_window.receive(data.flow_len)?;
        if let Some(increment) = self.recv_window.replenish() {
            let update = WindowUpdateFrame::new(CONNECTION_STREAM_ID, increment);
            FrameCodec::encode_window_update_frame(&update, &mut self.output);
        }

        let max_body = self.max_body_size;
        let Some(stream) = self.streams.get_mut(id) else {
            return Err(Error::stream(id, ErrorCode::ProtocolError, "DATA on unknown stream"));
        };

        if !stream.state().can_recv() {
            return Err(Error::stream(id, ErrorCode::ProtocolError, "DATA after END_STREAM"));
        }
        stream.apply(StreamEvent::RecvData { end_stream: data.end_stream })?;
        stream
            .recv_window
            .receive(data.flow_len)
            .map_err(|e| Error::stream(id, ErrorCode::FlowControlError, e.to_string()))?;

        if stream.body.len() + data.data.len() > max_body {
            self.reject(id, Status::PAYLOAD_TOO_LARGE);
            return Ok(());
        }
        stream.body.extend_from_slice(&data.data);

        if data.end_stream {
            return self.complete_request(id, events);
        }
        if let Some(increment) = stream.recv_window.replenish() {
            let update = WindowUpdateFrame::new(id, increment);
            FrameCodec::encode_window_update_frame(&update, &mut self.output);
        }
        Ok(())
    }

    fn on_headers(&mut self, frame: &Frame, events: &mut Vec<Event>) -> Result<()> {
        let headers = HeadersFrame::parse(frame)?;
        if headers.end_headers {
            return self.on_header_block(headers.stream_id, headers.end_stream, &headers.header_block, events);
        }
        self.continuation = Some(HeaderBlock {
            stream_id: headers.stream_id,
            end_stream: headers.end_stream,
            block: BytesMut::from(&headers.header_block[..]),
        });
        Ok(())
    }

    fn on_continuation(&mut self, frame: &Frame, events: &mut Vec<Event>) -> Result<()> {
        let Some(mut pending) = self.continuation.take() else {
            return Err(Error::Protocol("CONTINUATION without HEADERS".to_string()));
        };
        pending.block.extend_from_slice(&frame.payload);
        if pending.block.len() > MAX_HEADER_BLOCK {
            return Err(Error::Protocol("header block too large".to_string()));
        }

        if frame.flags.is_end_headers() {
            let block = pending.block.freeze();
            return self.on_header_block(pending.stream_id, pending.end_stream, &block, events);
        }
        self.continuation = Some(pending);
        Ok(())
    }

    fn on_header_block(
        &mut self,
        id: StreamId,
        end_stream: bool,
        block: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<()> {
        // Decode even when the stream is going to be refused so the
        // shared HPACK table stays in sync.
        let decoded = self
            .decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("{:?}", e)))?;

        let mut list_size = 0;
        let mut fields = Vec::with_capacity(decoded.len());
        for (name, value) in decoded {
            list_size += name.len() + value.len() + 32;
            let name = String::from_utf8(name)
                .map_err(|_| Error::stream(id, ErrorCode::ProtocolError, "non-UTF-8 header name"))?;
            let value = String::from_utf8(value)
                .map_err(|_| Error::stream(id, ErrorCode::ProtocolError, "non-UTF-8 header value"))?;
            fields.push((name, value));
        }

        if let Some(stream) = self.streams.get_mut(id) {
            // Trailers: they must end the request and carry no pseudo-headers.
            stream.apply(StreamEvent::RecvHeaders { end_stream })?;
            if fields.iter().any(|(name, _)| name.starts_with(':')) {
                return Err(Error::stream(id, ErrorCode::ProtocolError, "pseudo-header in trailers"));
            }
            return self.complete_request(id, events);
        }

        if !self.streams.is_idle_peer_id(id) {
            if id % 2 == 0 {
                return Err(Error::Protocol(format!("client used even stream id {}", id)));
            }
            return Err(Error::stream(id, ErrorCode::StreamClosed, "HEADERS on closed stream"));
        }
        if self.goaway_sent {
            trace!(stream_id = id, "ignoring stream opened after GOAWAY");
            return Ok(());
        }

        let stream = self.streams.open_peer_stream(
            id,
            self.remote.initial_window_size,
            self.local.initial_window_size,
        )?;
        stream.apply(StreamEvent::RecvHeaders { end_stream })?;
        let head = parse_request_head(id, &fields)?;
        stream.request_headers = fields;

        if let Some(max) = self.local.max_header_list_size {
            if list_size > max as usize {
                self.reject(id, Status::HEADER_FIELDS_TOO_LARGE);
                return Ok(());
            }
        }
        if head.content_length.is_some_and(|len| len > self.max_body_size) {
            self.reject(id, Status::PAYLOAD_TOO_LARGE);
            return Ok(());
        }

        if end_stream {
            self.complete_request(id, events)?;
        }
        Ok(())
    }

    /// Turn a stream whose request side has ended into an [`Event::Request`]
    fn complete_request(&mut self, id: StreamId, events: &mut Vec<Event>) -> Result<()> {
        let Some(stream) = self.streams.get_mut(id) else {
            return Ok(());
        };
        let body = std::mem::take(&mut stream.body).freeze();
        let head = parse_request_head(id, &stream.request_headers)?;

        if let Some(len) = head.content_length {
            if len != body.len() {
                return Err(Error::stream(
                    id,
                    ErrorCode::ProtocolError,
                    format!("content-length {} but {} octets received", len, body.len()),
                ));
            }
        }

        let Ok(method) = Method::from_str(&head.method) else {
            self.reject(id, Status::NOT_IMPLEMENTED);
            return Ok(());
        };

        let request = Request::builder()
            .method(method)
            .target(head.target)
            .version(Version::H2)
            .headers(head.headers)
            .body(body)
            .scheme(self.scheme)
            .build();
        events.push(Event::Request { stream_id: id, request });
        Ok(())
    }

    fn on_rst_stream(&mut self, frame: &Frame, events: &mut Vec<Event>) -> Result<()> {
        let rst = RstStreamFrame::parse(frame)?;
        if self.streams.is_idle_peer_id(rst.stream_id) {
            return Err(Error::Protocol(format!("RST_STREAM on idle stream {}", rst.stream_id)));
        }
        if let Some(mut stream) = self.streams.remove(rst.stream_id) {
            let _ = stream.apply(StreamEvent::Reset);
        }
        events.push(Event::StreamReset {
            stream_id: rst.stream_id,
            code: rst.error_code,
        });
        Ok(())
    }

    fn on_settings(&mut self, frame: &Frame) -> Result<()> {
        let settings = SettingsFrame::parse(frame)?;
        if settings.ack {
            return Ok(());
        }

        let old_window = self.remote.initial_window_size;
        for (id, value) in settings.params {
            self.remote.apply(id, value)?;
        }

        let new_window = self.remote.initial_window_size;
        if new_window != old_window {
            for stream in self.streams.iter_mut() {
                stream.send_window.update_initial_size(new_window)?;
            }
        }

        FrameCodec::encode_settings_frame(&SettingsFrame::ack(), &mut self.output);
        self.flush_all();
        Ok(())
    }

    fn on_ping(&mut self, frame: &Frame) -> Result<()> {
        let ping = PingFrame::parse(frame)?;
        if !ping.ack {
            FrameCodec::encode_ping_frame(&PingFrame::ack(ping.data), &mut self.output);
        }
        Ok(())
    }

    fn on_goaway(&mut self, frame: &Frame, events: &mut Vec<Event>) -> Result<()> {
        let goaway = GoawayFrame::parse(frame)?;
        debug!(
            last_stream_id = goaway.last_stream_id,
            code = %goaway.error_code,
            "peer sent GOAWAY"
        );
        self.peer_goaway = true;
        events.push(Event::GoAway {
            last_stream_id: goaway.last_stream_id,
            code: goaway.error_code,
        });
        Ok(())
    }

    fn on_window_update(&mut self, frame: &Frame) -> Result<()> {
        let update = WindowUpdateFrame::parse(frame)?;
        let id = update.stream_id;

        if id == CONNECTION_STREAM_ID {
            self.send_window.increase(update.size_increment)?;
        } else if let Some(stream) = self.streams.get_mut(id) {
            stream
                .send_window
                .increase(update.size_increment)
                .map_err(|e| Error::stream(id, ErrorCode::FlowControlError, e.to_string()))?;
        } else if self.streams.is_idle_peer_id(id) {
            return Err(Error::Protocol(format!("WINDOW_UPDATE on idle stream {}", id)));
        }

        self.flush_all();
        Ok(())
    }

    /// Queue the response HEADERS for a stream
    pub fn send_response(&mut self, id: StreamId, head: &ResponseHead, end_stream: bool) -> Result<()> {
        let stream = self
            .streams
            .get_mut(id)
            .ok_or_else(|| Error::stream(id, ErrorCode::StreamClosed, "response on unknown stream"))?;
        stream.apply(StreamEvent::SendHeaders { end_stream })?;

        let status = head.status.code().to_string();
        let mut fields = vec![(":status".to_string(), status)];
        for (name, value) in head.headers.iter() {
            let name = name.to_ascii_lowercase();
            if CONNECTION_SPECIFIC.contains(&name.as_str()) {
                continue;
            }
            fields.push((name, value.to_string()));
        }

        let block = self.encode_block(&fields)?;
        let frame = HeadersFrame::new(id, block, end_stream, true);
        FrameCodec::encode_headers_frame(&frame, self.remote.max_frame_size as usize, &mut self.output);
        self.streams.cleanup_closed();
        Ok(())
    }

    /// Queue response DATA; it is written as flow-control credit allows
    pub fn send_data(&mut self, id: StreamId, data: Bytes, end_stream: bool) -> Result<()> {
        let stream = self
            .streams
            .get_mut(id)
            .filter(|stream| stream.state().can_send())
            .ok_or_else(|| Error::stream(id, ErrorCode::StreamClosed, "DATA on closed stream"))?;

        if data.is_empty() {
            if !end_stream {
                return Ok(());
            }
            // Fold END_STREAM into DATA still waiting for credit.
            if let Some(queued) = stream.pending.back_mut() {
                queued.1 = true;
                return Ok(());
            }
        }
        stream.pending.push_back((data, end_stream));
        self.flush_stream(id);
        self.streams.cleanup_closed();
        Ok(())
    }

    fn flush_all(&mut self) {
        for id in self.streams.ids() {
            self.flush_stream(id);
        }
        self.streams.cleanup_closed();
    }

    /// Write as much queued DATA for `id` as the windows permit
    fn flush_stream(&mut self, id: StreamId) {
        let max_frame = self.remote.max_frame_size as usize;
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };

        while let Some((mut data, end_stream)) = stream.pending.pop_front() {
            if data.is_empty() {
                // A bare END_STREAM needs no credit.
                FrameCodec::encode_data_frame(&DataFrame::new(id, data, end_stream), &mut self.output);
                let _ = stream.apply(StreamEvent::SendData { end_stream });
                continue;
            }

            let credit = self
                .send_window
                .available()
                .min(stream.send_window.available())
                .min(max_frame);
            if credit == 0 {
                stream.pending.push_front((data, end_stream));
                break;
            }

            let chunk = if data.len() > credit {
                data.split_to(credit)
            } else {
                std::mem::take(&mut data)
            };
            self.send_window.consume(chunk.len());
            stream.send_window.consume(chunk.len());

            let last = data.is_empty() && end_stream;
            FrameCodec::encode_data_frame(&DataFrame::new(id, chunk, last), &mut self.output);
            let _ = stream.apply(StreamEvent::SendData { end_stream: last });

            if !data.is_empty() {
                stream.pending.push_front((data, end_stream));
            }
        }
    }

    /// Promise a pushed GET for `path` on `parent`
    ///
    /// Returns the promised stream and its synthesized request, or None
    /// when the client disabled push or the promise cannot be made.
    pub fn push_promise(&mut self, parent: StreamId, path: &str) -> Option<(StreamId, Request)> {
        if !self.remote.enable_push || self.goaway_sent || self.peer_goaway || !path.starts_with('/') {
            return None;
        }
        let parent_stream = self.streams.get(parent)?;
        if !matches!(
            parent_stream.state(),
            StreamState::Open | StreamState::HalfClosedRemote
        ) {
            return None;
        }
        let authority = parent_stream
            .request_headers
            .iter()
            .find(|(name, _)| name == ":authority" || name == "host")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        if let Some(max) = self.remote.max_concurrent_streams {
            let pushed = self
                .streams
                .iter()
                .filter(|s| s.id() % 2 == 0 && !s.state().is_closed())
                .count();
            if pushed >= max as usize {
                return None;
            }
        }

        let promised = match self.streams.reserve_push(self.remote.initial_window_size) {
            Ok(stream) => stream.id(),
            Err(e) => {
                debug!(error = %e, "push refused");
                return None;
            }
        };

        let fields = vec![
            (":method".to_string(), "GET".to_string()),
            (":scheme".to_string(), self.scheme.to_string()),
            (":authority".to_string(), authority.clone()),
            (":path".to_string(), path.to_string()),
        ];
        let header_block = match self.encode_block(&fields) {
            Ok(block) => block,
            Err(e) => {
                self.connection_error(e);
                return None;
            }
        };

        let frame = PushPromiseFrame {
            stream_id: parent,
            promised_stream_id: promised,
            header_block,
        };
        FrameCodec::encode_push_promise_frame(&frame, self.remote.max_frame_size as usize, &mut self.output);
        if let Some(parent_stream) = self.streams.get_mut(parent) {
            let _ = parent_stream.apply(StreamEvent::SendPushPromise);
        }

        let request = Request::builder()
            .method(Method::Get)
            .target(path)
            .version(Version::H2)
            .header("Host", authority)
            .scheme(self.scheme)
            .build();
        Some((promised, request))
    }

    /// Cancel a stream with RST_STREAM, dropping anything queued for it
    pub fn reset_stream(&mut self, id: StreamId, code: ErrorCode) {
        FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(id, code), &mut self.output);
        if let Some(mut stream) = self.streams.remove(id) {
            stream.pending.clear();
            let _ = stream.apply(StreamEvent::Reset);
        }
    }

    /// Send GOAWAY once; streams already accepted still complete
    pub fn go_away(&mut self, code: ErrorCode) {
        if self.goaway_sent {
            return;
        }
        let frame = GoawayFrame::new(self.streams.last_peer_stream_id(), code, Bytes::new());
        FrameCodec::encode_goaway_frame(&frame, &mut self.output);
        self.goaway_sent = true;
    }

    fn connection_error(&mut self, error: Error) {
        warn!(error = %error, code = %error.code(), "h2 connection error");
        self.go_away(error.code());
        self.failed = true;
    }

    /// Answer a stream directly, without involving the application
    fn reject(&mut self, id: StreamId, status: Status) {
        debug!(stream_id = id, status = status.code(), "h2 request rejected");
        let still_receiving = self
            .streams
            .get(id)
            .is_some_and(|stream| stream.state() == StreamState::Open);

        let (head, _) = HttpResponse::builder().status(status).build().into_parts();
        if self.send_response(id, &head, true).is_err() {
            self.reset_stream(id, ErrorCode::InternalError);
            return;
        }
        if still_receiving {
            let rst = RstStreamFrame::new(id, ErrorCode::NoError);
            FrameCodec::encode_rst_stream_frame(&rst, &mut self.output);
        }
        self.streams.remove(id);
    }

    fn encode_block(&mut self, fields: &[(String, String)]) -> Result<Bytes> {
        let mut block = Vec::new();
        self.encoder
            .encode_into(
                fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())),
                &mut block,
            )
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;
        Ok(Bytes::from(block))
    }

    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Response DATA waiting for flow-control credit
    pub fn pending_bytes(&self) -> usize {
        self.streams.iter().map(|stream| stream.pending_len()).sum()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn goaway_sent(&self) -> bool {
        self.goaway_sent
    }

    pub fn peer_goaway(&self) -> bool {
        self.peer_goaway
    }

    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(id).map(|stream| stream.state())
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote
    }
}

/// Validate a decoded request header list
///
/// Malformed requests are stream errors; the connection survives.
fn parse_request_head(id: StreamId, fields: &[(String, String)]) -> Result<RequestHead> {
    let malformed = |reason: &str| Error::stream(id, ErrorCode::ProtocolError, reason);

    let mut method = None;
    let mut scheme = None;
    let mut path = None;
    let mut authority = None;
    let mut headers = Headers::new();
    let mut regular_seen = false;

    for (name, value) in fields {
        if let Some(pseudo) = name.strip_prefix(':') {
            if regular_seen {
                return Err(malformed("pseudo-header after regular header"));
            }
            let slot = match pseudo {
                "method" => &mut method,
                "scheme" => &mut scheme,
                "path" => &mut path,
                "authority" => &mut authority,
                _ => return Err(malformed("unknown pseudo-header")),
            };
            if slot.is_some() {
                return Err(malformed("duplicate pseudo-header"));
            }
            *slot = Some(value.clone());
            continue;
        }

        regular_seen = true;
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(malformed("uppercase header name"));
        }
        if CONNECTION_SPECIFIC.contains(&name.as_str()) {
            return Err(malformed("connection-specific header"));
        }
        if name == "te" && value != "trailers" {
            return Err(malformed("TE other than trailers"));
        }
        Headers::validate_field(name, value).map_err(|_| malformed("invalid header field"))?;
        headers.combine(name.clone(), value.clone());
    }

    let method = method.ok_or_else(|| malformed("missing :method"))?;
    let target = if method == "CONNECT" {
        authority.clone().ok_or_else(|| malformed("CONNECT without :authority"))?
    } else {
        if scheme.is_none() {
            return Err(malformed("missing :scheme"));
        }
        match path {
            Some(path) if !path.is_empty() => path,
            _ => return Err(malformed("missing :path")),
        }
    };

    if !headers.contains("host") {
        if let Some(authority) = authority {
            headers.insert("host", authority);
        }
    }

    let content_length = headers
        .content_length()
        .map_err(|_| malformed("invalid content-length"))?
        .map(|len| usize::try_from(len).unwrap_or(usize::MAX));

    Ok(RequestHead {
        method,
        target,
        headers,
        content_length,
    })
}

/// A stream whose response is being produced
struct InFlight {
    meta: RequestMeta,
    task: JoinHandle<()>,
    status: u16,
    bytes: u64,
}

/// Per-connection state of [`serve`]
struct Driver<'a> {
    conn: H2Connection,
    inflight: HashMap<StreamId, InFlight>,
    service: &'a Arc<Service>,
    info: &'a ConnectionInfo,
    events_tx: mpsc::Sender<(StreamId, ResponseEvent)>,
    shutdown: ShutdownSignal,
}

impl Driver<'_> {
    fn on_event(&mut self, event: Event) {
        match event {
            Event::Request { stream_id, request } => self.dispatch(stream_id, request),
            Event::StreamReset { stream_id, code } => {
                if let Some(flight) = self.inflight.remove(&stream_id) {
                    debug!(stream_id, code = %code, request_id = %flight.meta.request_id, "stream reset");
                    flight.task.abort();
                }
            }
            Event::GoAway { .. } => {}
        }
    }

    fn dispatch(&mut self, stream_id: StreamId, mut request: Request) {
        let meta = self.service.prepare(&mut request, self.info.peer);
        let task = spawn_forwarder(
            self.service.clone(),
            stream_id,
            request,
            self.events_tx.clone(),
            self.shutdown.clone(),
        );
        self.inflight.insert(
            stream_id,
            InFlight {
                meta,
                task,
                status: 0,
                bytes: 0,
            },
        );
    }

    fn on_response(&mut self, stream_id: StreamId, event: ResponseEvent) {
        let Some(flight) = self.inflight.get_mut(&stream_id) else {
            return;
        };

        match event {
            ResponseEvent::Head { mut head, push } => {
                flight.meta.decorate(&mut head);
                flight.status = head.status.code();
                let end_stream = flight.meta.is_head() || head.status.forbids_body();

                // PUSH_PROMISE must precede the parent's response HEADERS.
                let pushed: Vec<_> = push
                    .iter()
                    .filter_map(|path| self.conn.push_promise(stream_id, path))
                    .collect();
                for (promised, request) in pushed {
                    self.dispatch(promised, request);
                }

                if let Err(e) = self.conn.send_response(stream_id, &head, end_stream) {
                    debug!(stream_id, error = %e, "response headers not sent");
                    self.abandon(stream_id);
                } else if end_stream {
                    self.finish(stream_id);
                }
            }
            ResponseEvent::Chunk { data, last } => {
                flight.bytes += data.len() as u64;
                if self.conn.send_data(stream_id, data, last).is_err() {
                    self.abandon(stream_id);
                } else if last {
                    self.finish(stream_id);
                }
            }
            ResponseEvent::End => {
                if self.conn.send_data(stream_id, Bytes::new(), true).is_err() {
                    self.abandon(stream_id);
                } else {
                    self.finish(stream_id);
                }
            }
            ResponseEvent::Failed { headers_sent } => {
                debug!(stream_id, headers_sent, "response failed");
                observability::record_error("h2_response");
                if !headers_sent {
                    flight.status = 500;
                }
                self.conn.reset_stream(stream_id, ErrorCode::InternalError);
                self.finish(stream_id);
            }
        }
    }

    /// Log a completed response and stop its forwarder
    fn finish(&mut self, stream_id: StreamId) {
        if let Some(flight) = self.inflight.remove(&stream_id) {
            flight.meta.log_access(flight.status, flight.bytes, "HTTP/2");
            flight.task.abort();
        }
    }

    /// Drop a response whose stream went away
    fn abandon(&mut self, stream_id: StreamId) {
        if let Some(flight) = self.inflight.remove(&stream_id) {
            flight.task.abort();
        }
    }

    fn idle(&self) -> bool {
        self.inflight.is_empty()
    }
}

/// Relay one stream's response events into the connection's channel
fn spawn_forwarder(
    service: Arc<Service>,
    stream_id: StreamId,
    request: Request,
    tx: mpsc::Sender<(StreamId, ResponseEvent)>,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = service.respond(request, &shutdown).await;
        let mut headers_sent = false;
        while let Some(event) = events.recv().await {
            let terminal = matches!(
                event,
                ResponseEvent::End | ResponseEvent::Chunk { last: true, .. } | ResponseEvent::Failed { .. }
            );
            headers_sent |= matches!(event, ResponseEvent::Head { .. });
            if tx.send((stream_id, event)).await.is_err() || terminal {
                return;
            }
        }
        let _ = tx.send((stream_id, ResponseEvent::Failed { headers_sent })).await;
    })
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn write_output<S: AsyncWrite + Unpin>(io: &mut S, conn: &mut H2Connection, timeout: Duration) -> Result<()> {
    while conn.has_output() {
        let out = conn.take_output();
        match tokio::time::timeout(timeout, io.write_all(&out)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Io(std::io::ErrorKind::TimedOut.into())),
        }
    }
    io.flush().await?;
    Ok(())
}

/// Serve one HTTP/2 connection until it closes
///
/// `prelude` holds bytes already read while detecting the protocol.
pub async fn serve<S>(
    mut io: S,
    prelude: BytesMut,
    info: ConnectionInfo,
    service: Arc<Service>,
    shutdown: ShutdownSignal,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let settings = service.h2_settings.clone().unwrap_or_default();
    let timeouts = service.timeouts.clone();
    let (events_tx, mut events_rx) = mpsc::channel(64);

    let mut conn = H2Connection::new(settings, service.limits.max_body, info.scheme());
    conn.start();
    let pending = conn.receive(&prelude);

    let mut driver = Driver {
        conn,
        inflight: HashMap::new(),
        service: &service,
        info: &info,
        events_tx,
        shutdown: shutdown.clone(),
    };
    for event in pending {
        driver.on_event(event);
    }

    let mut draining = shutdown.clone();
    let mut terminated = shutdown.clone();
    let mut read_buf = BytesMut::with_capacity(16 * 1024);

    let result = loop {
        if let Err(e) = write_output(&mut io, &mut driver.conn, timeouts.write()).await {
            break Err(e);
        }
        if driver.conn.is_failed() {
            break Ok(());
        }
        if (driver.conn.goaway_sent() || driver.conn.peer_goaway()) && driver.idle() {
            break Ok(());
        }

        let stalled = driver.conn.pending_bytes() >= MAX_PENDING_DATA;
        let timeout = if driver.idle() {
            Some(timeouts.keep_alive())
        } else if driver.conn.pending_bytes() > 0 {
            Some(timeouts.write())
        } else {
            None
        };
        let is_draining = driver.conn.goaway_sent();

        tokio::select! {
            biased;
            _ = terminated.terminated() => break Ok(()),
            _ = draining.draining(), if !is_draining => {
                debug!(conn = %info.id, "draining h2 connection");
                driver.conn.go_away(ErrorCode::NoError);
            }
            Some((stream_id, event)) = events_rx.recv(), if !stalled => {
                driver.on_response(stream_id, event);
            }
            read = io.read_buf(&mut read_buf) => match read {
                Ok(0) => break Ok(()),
                Ok(_) => {
                    let events = driver.conn.receive(&read_buf);
                    read_buf.clear();
                    for event in events {
                        driver.on_event(event);
                    }
                }
                Err(e) => break Err(e.into()),
            },
            _ = sleep_or_pending(timeout) => {
                debug!(conn = %info.id, "h2 connection timed out");
                driver.conn.go_away(ErrorCode::NoError);
                let _ = write_output(&mut io, &mut driver.conn, timeouts.write()).await;
                break Ok(());
            }
        }
    };

    for (_, flight) in driver.inflight.drain() {
        flight.task.abort();
    }
    let _ = io.shutdown().await;
    result
}
