//! HTTP/2 streams
//!
//! A stream's lifecycle is a [`StreamState`] value advanced by the pure
//! [`StreamState::transition`] function. Illegal events return the error
//! code the connection answers with instead of mutating anything.

use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControlWindow;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};

/// Stream ID type
pub type StreamId = u32;

/// Stream state, from the server's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    /// Promised with PUSH_PROMISE; the server will answer on it
    ReservedRemote,
    /// Request headers received, request body still arriving
    Open,
    /// Request complete; only the response remains
    HalfClosedRemote,
    Closed,
}

/// Something that happens to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    RecvHeaders { end_stream: bool },
    RecvData { end_stream: bool },
    SendPushPromise,
    SendHeaders { end_stream: bool },
    SendData { end_stream: bool },
    Reset,
}

impl StreamState {
    /// Next state after `event`, or the error code the event violates
    pub fn transition(self, event: StreamEvent) -> std::result::Result<StreamState, ErrorCode> {
        use StreamEvent::*;
        use StreamState::*;

        let after_send = |end_stream: bool, open: StreamState| if end_stream { Closed } else { open };

        match (self, event) {
            (_, Reset) => Ok(Closed),

            (Idle, RecvHeaders { end_stream: true }) => Ok(HalfClosedRemote),
            (Idle, RecvHeaders { end_stream: false }) => Ok(Open),
            (Idle, SendPushPromise) => Ok(ReservedRemote),
            (Idle, _) => Err(ErrorCode::ProtocolError),

            // Trailers must end the request.
            (Open, RecvHeaders { end_stream: true }) => Ok(HalfClosedRemote),
            (Open, RecvHeaders { end_stream: false }) => Err(ErrorCode::ProtocolError),
            (Open, RecvData { end_stream: true }) => Ok(HalfClosedRemote),
            (Open, RecvData { end_stream: false }) => Ok(Open),
            (Open, SendHeaders { end_stream } | SendData { end_stream }) => {
                Ok(after_send(end_stream, Open))
            }
            (Open, SendPushPromise) => Ok(Open),

            (ReservedRemote, SendHeaders { end_stream }) => Ok(after_send(end_stream, HalfClosedRemote)),
            (ReservedRemote, _) => Err(ErrorCode::ProtocolError),

            (HalfClosedRemote, RecvHeaders { .. } | RecvData { .. }) => Err(ErrorCode::StreamClosed),
            (HalfClosedRemote, SendHeaders { end_stream } | SendData { end_stream }) => {
                Ok(after_send(end_stream, HalfClosedRemote))
            }
            (HalfClosedRemote, SendPushPromise) => Ok(HalfClosedRemote),

            (Closed, _) => Err(ErrorCode::StreamClosed),
        }
    }

    /// Whether the server may still send on this stream
    pub fn can_send(&self) -> bool {
        matches!(
            self,
            StreamState::Open | StreamState::HalfClosedRemote | StreamState::ReservedRemote
        )
    }

    /// Whether the peer may still send DATA on this stream
    pub fn can_recv(&self) -> bool {
        matches!(self, StreamState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// One HTTP/2 stream
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    /// Decoded request header list
    pub(crate) request_headers: Vec<(String, String)>,
    /// Accumulated request body
    pub(crate) body: BytesMut,
    pub(crate) send_window: FlowControlWindow,
    pub(crate) recv_window: FlowControlWindow,
    /// Response DATA waiting for send credit; the flag marks END_STREAM
    pub(crate) pending: VecDeque<(Bytes, bool)>,
}

impl H2Stream {
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            request_headers: Vec::new(),
            body: BytesMut::new(),
            send_window: FlowControlWindow::with_initial_size(send_window),
            recv_window: FlowControlWindow::with_initial_size(recv_window),
            pending: VecDeque::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Apply an event; illegal events become a stream error on this stream
    pub fn apply(&mut self, event: StreamEvent) -> Result<StreamState> {
        match self.state.transition(event) {
            Ok(next) => {
                self.state = next;
                Ok(next)
            }
            Err(code) => Err(Error::stream(
                self.id,
                code,
                format!("{:?} not allowed in state {:?}", event, self.state),
            )),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Octets of response DATA queued behind flow control
    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(|(data, _)| data.len()).sum()
    }
}

/// Stream table of one server connection
#[derive(Debug)]
pub struct StreamManager {
    streams: HashMap<StreamId, H2Stream>,
    /// Highest client-initiated id seen so far
    last_peer_stream_id: StreamId,
    /// Next even id for pushed streams
    next_push_id: StreamId,
    /// Our advertised SETTINGS_MAX_CONCURRENT_STREAMS
    max_concurrent_streams: u32,
}

impl StreamManager {
    pub fn new(max_concurrent_streams: u32) -> Self {
        StreamManager {
            streams: HashMap::new(),
            last_peer_stream_id: 0,
            next_push_id: 2,
            max_concurrent_streams,
        }
    }

    pub fn last_peer_stream_id(&self) -> StreamId {
        self.last_peer_stream_id
    }

    /// Whether `id` names a client stream that was never opened
    pub fn is_idle_peer_id(&self, id: StreamId) -> bool {
        id % 2 == 1 && id > self.last_peer_stream_id
    }

    /// Open a client-initiated stream
    ///
    /// Ids must be odd and increasing; a violation is a connection error.
    /// Exceeding the concurrency limit refuses just this stream.
    pub fn open_peer_stream(
        &mut self,
        id: StreamId,
        send_window: u32,
        recv_window: u32,
    ) -> Result<&mut H2Stream> {
        if id % 2 == 0 {
            return Err(Error::Protocol(format!("client opened even stream {}", id)));
        }
        if id <= self.last_peer_stream_id {
            return Err(Error::Protocol(format!(
                "stream id {} not greater than {}",
                id, self.last_peer_stream_id
            )));
        }
        self.last_peer_stream_id = id;

        if self.active_count() >= self.max_concurrent_streams as usize {
            return Err(Error::stream(
                id,
                ErrorCode::RefusedStream,
                "too many concurrent streams",
            ));
        }

        Ok(self
            .streams
            .entry(id)
            .or_insert_with(|| H2Stream::new(id, send_window, recv_window)))
    }

    /// Allocate and insert a server-pushed stream
    pub fn reserve_push(&mut self, send_window: u32) -> Result<&mut H2Stream> {
        let id = self.next_push_id;
        if id > super::MAX_STREAM_ID {
            return Err(Error::Internal("push stream ids exhausted".to_string()));
        }
        self.next_push_id += 2;

        let mut stream = H2Stream::new(id, send_window, 0);
        stream.apply(StreamEvent::SendPushPromise)?;
        Ok(self.streams.entry(id).or_insert(stream))
    }

    pub fn get(&self, id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<H2Stream> {
        self.streams.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &H2Stream> {
        self.streams.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut H2Stream> {
        self.streams.values_mut()
    }

    /// Streams not yet closed
    pub fn active_count(&self) -> usize {
        self.streams.values().filter(|s| !s.state().is_closed()).count()
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Drop closed streams that have nothing left to send
    pub fn cleanup_closed(&mut self) {
        self.streams
            .retain(|_, stream| !(stream.state().is_closed() && stream.pending.is_empty()));
    }
}
