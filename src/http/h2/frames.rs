//! HTTP/2 frame types
//!
//! [`Frame`] is the raw unit produced by the codec. The typed frames below
//! are parsed out of it on demand and validated against the structural
//! rules of RFC 9113 Section 6.

use super::error::{Error, ErrorCode, Result};
use super::stream::StreamId;
use bytes::{Buf, Bytes};
use std::fmt;

/// HTTP/2 frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const END_STREAM: u8 = 0x1;
    /// Shares its bit with END_STREAM; used by SETTINGS and PING
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A raw frame as read off the wire
///
/// The type byte is kept raw so that frames of unknown type can be
/// recognised and skipped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub flags: FrameFlags,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, flags: FrameFlags, stream_id: StreamId, payload: Bytes) -> Self {
        Frame {
            kind: kind.as_u8(),
            flags,
            stream_id,
            payload,
        }
    }

    /// Known frame type, or None for extension frames
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Remove the pad-length octet and trailing padding from a payload
fn strip_padding(mut payload: Bytes, padded: bool) -> Result<Bytes> {
    if !padded {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(Error::FrameSize("padded frame without pad length".to_string()));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(Error::Protocol("padding exceeds frame payload".to_string()));
    }
    Ok(payload.slice(..payload.len() - pad_len))
}

/// DATA frame (RFC 9113 Section 6.1)
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub data: Bytes,
    pub end_stream: bool,
    /// Octets counted against flow control, padding included
    pub flow_len: usize,
}

impl DataFrame {
    pub fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        let flow_len = data.len();
        DataFrame {
            stream_id,
            data,
            end_stream,
            flow_len,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("DATA on stream 0".to_string()));
        }
        let flow_len = frame.payload.len();
        let data = strip_padding(frame.payload.clone(), frame.flags.is_padded())?;
        Ok(DataFrame {
            stream_id: frame.stream_id,
            data,
            end_stream: frame.flags.is_end_stream(),
            flow_len,
        })
    }
}

/// Stream dependency carried by HEADERS and PRIORITY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub stream_dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

impl PrioritySpec {
    fn parse(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < 5 {
            return Err(Error::FrameSize("truncated priority fields".to_string()));
        }
        let dep = buf.get_u32();
        Ok(PrioritySpec {
            stream_dependency: dep & 0x7FFF_FFFF,
            exclusive: dep & 0x8000_0000 != 0,
            weight: buf.get_u8(),
        })
    }
}

/// HEADERS frame (RFC 9113 Section 6.2)
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PrioritySpec>,
}

impl HeadersFrame {
    pub fn new(stream_id: StreamId, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority: None,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("HEADERS on stream 0".to_string()));
        }
        let mut block = strip_padding(frame.payload.clone(), frame.flags.is_padded())?;
        let priority = if frame.flags.is_priority() {
            let spec = PrioritySpec::parse(&mut block)?;
            if spec.stream_dependency == frame.stream_id {
                return Err(Error::stream(
                    frame.stream_id,
                    ErrorCode::ProtocolError,
                    "stream depends on itself",
                ));
            }
            Some(spec)
        } else {
            None
        };
        Ok(HeadersFrame {
            stream_id: frame.stream_id,
            header_block: block,
            end_stream: frame.flags.is_end_stream(),
            end_headers: frame.flags.is_end_headers(),
            priority,
        })
    }
}

/// PRIORITY frame (RFC 9113 Section 6.3)
#[derive(Debug, Clone, Copy)]
pub struct PriorityFrame {
    pub stream_id: StreamId,
    pub priority: PrioritySpec,
}

impl PriorityFrame {
    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("PRIORITY on stream 0".to_string()));
        }
        if frame.payload.len() != 5 {
            return Err(Error::stream(
                frame.stream_id,
                ErrorCode::FrameSizeError,
                "PRIORITY payload must be 5 octets",
            ));
        }
        let priority = PrioritySpec::parse(&mut frame.payload.clone())?;
        Ok(PriorityFrame {
            stream_id: frame.stream_id,
            priority,
        })
    }
}

/// RST_STREAM frame (RFC 9113 Section 6.4)
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: StreamId, error_code: ErrorCode) -> Self {
        RstStreamFrame {
            stream_id,
            error_code,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("RST_STREAM on stream 0".to_string()));
        }
        if frame.payload.len() != 4 {
            return Err(Error::FrameSize("RST_STREAM payload must be 4 octets".to_string()));
        }
        let code = frame.payload.clone().get_u32();
        Ok(RstStreamFrame::new(frame.stream_id, ErrorCode::from_u32(code)))
    }
}

/// SETTINGS frame (RFC 9113 Section 6.5)
#[derive(Debug, Clone, Default)]
pub struct SettingsFrame {
    pub ack: bool,
    /// Raw (identifier, value) pairs in wire order
    pub params: Vec<(u16, u32)>,
}

impl SettingsFrame {
    pub fn new(params: Vec<(u16, u32)>) -> Self {
        SettingsFrame { ack: false, params }
    }

    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            params: Vec::new(),
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.stream_id != 0 {
            return Err(Error::Protocol("SETTINGS on a stream".to_string()));
        }
        if frame.flags.is_ack() {
            if !frame.payload.is_empty() {
                return Err(Error::FrameSize("SETTINGS ACK with payload".to_string()));
            }
            return Ok(SettingsFrame::ack());
        }
        if frame.payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                frame.payload.len()
            )));
        }
        let mut payload = frame.payload.clone();
        let mut params = Vec::with_capacity(payload.len() / 6);
        while payload.has_remaining() {
            params.push((payload.get_u16(), payload.get_u32()));
        }
        Ok(SettingsFrame::new(params))
    }
}

/// PUSH_PROMISE frame (RFC 9113 Section 6.6)
#[derive(Debug, Clone)]
pub struct PushPromiseFrame {
    pub stream_id: StreamId,
    pub promised_stream_id: StreamId,
    pub header_block: Bytes,
}

/// PING frame (RFC 9113 Section 6.7)
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.stream_id != 0 {
            return Err(Error::Protocol("PING on a stream".to_string()));
        }
        let data: [u8; 8] = frame.payload[..]
            .try_into()
            .map_err(|_| Error::FrameSize("PING payload must be 8 octets".to_string()))?;
        Ok(PingFrame {
            ack: frame.flags.is_ack(),
            data,
        })
    }
}

/// GOAWAY frame (RFC 9113 Section 6.8)
#[derive(Debug, Clone)]
pub struct GoawayFrame {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: StreamId, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.stream_id != 0 {
            return Err(Error::Protocol("GOAWAY on a stream".to_string()));
        }
        if frame.payload.len() < 8 {
            return Err(Error::FrameSize("GOAWAY payload shorter than 8 octets".to_string()));
        }
        let mut payload = frame.payload.clone();
        let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
        let error_code = ErrorCode::from_u32(payload.get_u32());
        Ok(GoawayFrame::new(last_stream_id, error_code, payload))
    }
}

/// WINDOW_UPDATE frame (RFC 9113 Section 6.9)
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    /// 0 for the connection window
    pub stream_id: StreamId,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.payload.len() != 4 {
            return Err(Error::FrameSize("WINDOW_UPDATE payload must be 4 octets".to_string()));
        }
        let increment = frame.payload.clone().get_u32() & 0x7FFF_FFFF;
        if increment == 0 {
            return Err(if frame.stream_id == 0 {
                Error::Protocol("zero WINDOW_UPDATE increment".to_string())
            } else {
                Error::stream(
                    frame.stream_id,
                    ErrorCode::ProtocolError,
                    "zero WINDOW_UPDATE increment",
                )
            });
        }
        Ok(WindowUpdateFrame::new(frame.stream_id, increment))
    }
}
