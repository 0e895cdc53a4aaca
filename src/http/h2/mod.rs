//! HTTP/2 server protocol
//!
//! # Architecture
//!
//! - [`codec`] cuts the byte stream into [`Frame`]s and encodes outgoing ones
//! - [`frames`] gives each frame type a typed, validated view
//! - [`settings`] holds the two settings tables of a connection
//! - [`stream`] is the per-stream state machine and stream table
//! - [`flow_control`] tracks send and receive windows
//! - [`server`] ties them together: [`H2Connection`] is a sans-I/O state
//!   machine fed with bytes, [`serve`] drives it over a socket
//!
//! Header blocks are compressed with the `hpack` crate. Any violation ends
//! in RST_STREAM when it concerns one stream, otherwise in GOAWAY; frame
//! processing never fails past those two recovery actions.

pub mod codec;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod server;
pub mod settings;
pub mod stream;

pub use error::{Error, ErrorCode, Result};
pub use frames::{DataFrame, Frame, FrameFlags, FrameType, HeadersFrame, SettingsFrame};
pub use server::{serve, Event, H2Connection};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{H2Stream, StreamId, StreamState};

/// Connection preface every client sends first
///
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n" (RFC 9113 Section 3.4)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
