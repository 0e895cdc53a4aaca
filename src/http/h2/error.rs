//! HTTP/2 error types
//!
//! Every failure detected while processing frames maps to an RFC 9113
//! error code. Errors carrying a stream id are answered with RST_STREAM
//! on that stream; the rest tear down the connection with GOAWAY.

use super::stream::StreamId;
use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level PROTOCOL_ERROR
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Flow control error: {0}")]
    FlowControl(String),

    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Header block could not be decoded; the shared table is now unusable
    #[error("Compression error: {0}")]
    Compression(String),

    /// Error confined to a single stream
    #[error("Stream {id} error {code}: {reason}")]
    Stream {
        id: StreamId,
        code: ErrorCode,
        reason: String,
    },

    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Build a stream-scoped error
    pub fn stream(id: StreamId, code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::Stream {
            id,
            code,
            reason: reason.into(),
        }
    }

    /// Error code sent to the peer
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) => ErrorCode::ProtocolError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::Stream { code, .. } => *code,
            Error::ConnectionClosed => ErrorCode::NoError,
            Error::Io(_) | Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Stream the error is confined to, or None for connection errors
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Error::Stream { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// HTTP/2 error codes (RFC 9113 Section 7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Map a wire value to a code
    ///
    /// Unknown codes are treated as INTERNAL_ERROR.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::ProtocolError.as_u32(), 0x1);
        assert_eq!(ErrorCode::from_u32(0x8), ErrorCode::Cancel);
        assert_eq!(ErrorCode::from_u32(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn test_stream_errors_are_scoped() {
        let err = Error::stream(3, ErrorCode::ProtocolError, "DATA on idle stream");
        assert_eq!(err.stream_id(), Some(3));
        assert_eq!(err.code(), ErrorCode::ProtocolError);

        let err = Error::FrameSize("SETTINGS ACK with payload".into());
        assert_eq!(err.stream_id(), None);
        assert_eq!(err.code(), ErrorCode::FrameSizeError);
    }

    #[test]
    fn test_error_display() {
        let err = Error::Protocol("test error".to_string());
        assert_eq!(err.to_string(), "Protocol error: test error");

        let err = Error::stream(5, ErrorCode::StreamClosed, "gone");
        assert_eq!(err.to_string(), "Stream 5 error STREAM_CLOSED (0x5): gone");
    }
}
