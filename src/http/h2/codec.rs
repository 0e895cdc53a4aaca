//! HTTP/2 frame encoding and decoding
//!
//! Decoding is incremental: bytes are appended with [`FrameCodec::extend`]
//! and whole frames are pulled out with [`FrameCodec::decode`]. Encoders
//! append complete frames to an output buffer.

use super::error::{Error, Result};
use super::frames::*;
use super::stream::StreamId;
use super::DEFAULT_MAX_FRAME_SIZE;
use bytes::{BufMut, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Incremental frame decoder
#[derive(Debug)]
pub struct FrameCodec {
    read_buffer: BytesMut,
    /// Largest payload accepted, as advertised in our SETTINGS
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(16 * 1024),
            max_frame_size: max_frame_size as usize,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.read_buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Consume exactly `n` raw bytes, if that many are buffered
    pub fn take_raw(&mut self, n: usize) -> Option<BytesMut> {
        (self.read_buffer.len() >= n).then(|| self.read_buffer.split_to(n))
    }

    /// Pull the next complete frame out of the buffer
    ///
    /// A payload longer than the advertised maximum is a FRAME_SIZE_ERROR.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.read_buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.read_buffer[..FRAME_HEADER_SIZE]);
        let (kind, flags, stream_id, length) = Self::decode_header(&header);

        if length > self.max_frame_size {
            return Err(Error::FrameSize(format!(
                "frame payload {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }
        if self.read_buffer.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        let _ = self.read_buffer.split_to(FRAME_HEADER_SIZE);
        let payload = self.read_buffer.split_to(length).freeze();
        Ok(Some(Frame {
            kind,
            flags,
            stream_id,
            payload,
        }))
    }

    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: StreamId,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // 24-bit length
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Reserved bit is always sent as 0
        header[5..9].copy_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());

        header
    }

    /// Decode a frame header into (type, flags, stream id, length)
    ///
    /// The reserved bit of the stream id is masked off.
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, FrameFlags, StreamId, usize) {
        let length =
            ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let flags = FrameFlags::from_u8(bytes[4]);
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFF_FFFF;

        (bytes[3], flags, stream_id, length)
    }

    pub fn encode_data_frame(frame: &DataFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        dst.put_slice(&Self::encode_header(FrameType::Data, flags, frame.stream_id, frame.data.len()));
        dst.put_slice(&frame.data);
    }

    /// Encode a HEADERS frame, splitting into CONTINUATION frames when the
    /// block exceeds the peer's maximum frame size
    pub fn encode_headers_frame(frame: &HeadersFrame, max_frame_size: usize, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        Self::encode_header_block(
            FrameType::Headers,
            flags,
            frame.stream_id,
            &[],
            &frame.header_block,
            max_frame_size,
            dst,
        );
    }

    pub fn encode_push_promise_frame(frame: &PushPromiseFrame, max_frame_size: usize, dst: &mut BytesMut) {
        let promised = (frame.promised_stream_id & 0x7FFF_FFFF).to_be_bytes();
        Self::encode_header_block(
            FrameType::PushPromise,
            FrameFlags::empty(),
            frame.stream_id,
            &promised,
            &frame.header_block,
            max_frame_size,
            dst,
        );
    }

    fn encode_header_block(
        frame_type: FrameType,
        mut flags: FrameFlags,
        stream_id: StreamId,
        prefix: &[u8],
        block: &[u8],
        max_frame_size: usize,
        dst: &mut BytesMut,
    ) {
        let max_frame_size = max_frame_size.max(DEFAULT_MAX_FRAME_SIZE as usize);
        let first_len = block.len().min(max_frame_size - prefix.len());
        let (first, mut rest) = block.split_at(first_len);

        if rest.is_empty() {
            flags.set(FrameFlags::END_HEADERS);
        }
        dst.put_slice(&Self::encode_header(frame_type, flags, stream_id, prefix.len() + first.len()));
        dst.put_slice(prefix);
        dst.put_slice(first);

        while !rest.is_empty() {
            let n = rest.len().min(max_frame_size);
            let (chunk, tail) = rest.split_at(n);
            rest = tail;

            let mut flags = FrameFlags::empty();
            if rest.is_empty() {
                flags.set(FrameFlags::END_HEADERS);
            }
            dst.put_slice(&Self::encode_header(FrameType::Continuation, flags, stream_id, chunk.len()));
            dst.put_slice(chunk);
        }
    }

    pub fn encode_settings_frame(frame: &SettingsFrame, dst: &mut BytesMut) {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };
        let params: &[(u16, u32)] = if frame.ack { &[] } else { &frame.params };

        dst.put_slice(&Self::encode_header(FrameType::Settings, flags, 0, params.len() * 6));
        for (id, value) in params {
            dst.put_u16(*id);
            dst.put_u32(*value);
        }
    }

    pub fn encode_ping_frame(frame: &PingFrame, dst: &mut BytesMut) {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };
        dst.put_slice(&Self::encode_header(FrameType::Ping, flags, 0, 8));
        dst.put_slice(&frame.data);
    }

    pub fn encode_goaway_frame(frame: &GoawayFrame, dst: &mut BytesMut) {
        let payload_len = 8 + frame.debug_data.len();
        dst.put_slice(&Self::encode_header(FrameType::Goaway, FrameFlags::empty(), 0, payload_len));
        dst.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        dst.put_u32(frame.error_code.as_u32());
        dst.put_slice(&frame.debug_data);
    }

    pub fn encode_window_update_frame(frame: &WindowUpdateFrame, dst: &mut BytesMut) {
        dst.put_slice(&Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        dst.put_u32(frame.size_increment & 0x7FFF_FFFF);
    }

    pub fn encode_rst_stream_frame(frame: &RstStreamFrame, dst: &mut BytesMut) {
        dst.put_slice(&Self::encode_header(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        dst.put_u32(frame.error_code.as_u32());
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::error::ErrorCode;
    use bytes::Bytes;

    #[test]
    fn test_encode_decode_header() {
        let flags = FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS);
        let header = FrameCodec::encode_header(FrameType::Headers, flags, 42, 1234);
        let (kind, decoded_flags, stream_id, length) = FrameCodec::decode_header(&header);

        assert_eq!(kind, FrameType::Headers.as_u8());
        assert_eq!(decoded_flags, flags);
        assert_eq!(stream_id, 42);
        assert_eq!(length, 1234);
    }

    #[test]
    fn test_reserved_bit_masked() {
        let header = [0, 0, 0, 0x0, 0, 0x80, 0, 0, 0x01];
        let (_, _, stream_id, _) = FrameCodec::decode_header(&header);
        assert_eq!(stream_id, 1);
    }

    #[test]
    fn test_decode_incremental() {
        let mut out = BytesMut::new();
        FrameCodec::encode_data_frame(&DataFrame::new(1, Bytes::from("Hello"), true), &mut out);

        let mut codec = FrameCodec::default();
        codec.extend(&out[..6]);
        assert!(codec.decode().unwrap().is_none());
        codec.extend(&out[6..]);

        let frame = codec.decode().unwrap().unwrap();
        assert_eq!(frame.frame_type(), Some(FrameType::Data));
        assert!(frame.flags.is_end_stream());
        assert_eq!(frame.stream_id, 1);
        assert_eq!(&frame.payload[..], b"Hello");
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut codec = FrameCodec::default();
        codec.extend(&FrameCodec::encode_header(
            FrameType::Data,
            FrameFlags::empty(),
            1,
            16385,
        ));
        assert!(matches!(codec.decode(), Err(Error::FrameSize(_))));
    }

    #[test]
    fn test_large_header_block_uses_continuation() {
        let block = vec![0x82u8; 20000];
        let frame = HeadersFrame::new(1, Bytes::from(block), true, true);
        let mut out = BytesMut::new();
        FrameCodec::encode_headers_frame(&frame, 16384, &mut out);

        let mut codec = FrameCodec::default();
        codec.extend(&out);
        let first = codec.decode().unwrap().unwrap();
        let second = codec.decode().unwrap().unwrap();

        assert_eq!(first.frame_type(), Some(FrameType::Headers));
        assert!(first.flags.is_end_stream());
        assert!(!first.flags.is_end_headers());
        assert_eq!(first.payload_len(), 16384);

        assert_eq!(second.frame_type(), Some(FrameType::Continuation));
        assert!(second.flags.is_end_headers());
        assert_eq!(second.payload_len(), 20000 - 16384);
    }

    #[test]
    fn test_encode_push_promise() {
        let frame = PushPromiseFrame {
            stream_id: 1,
            promised_stream_id: 2,
            header_block: Bytes::from_static(b"\x82"),
        };
        let mut out = BytesMut::new();
        FrameCodec::encode_push_promise_frame(&frame, 16384, &mut out);

        assert_eq!(&out[0..3], &[0, 0, 5]);
        assert_eq!(out[3], FrameType::PushPromise.as_u8());
        assert_eq!(out[4], FrameFlags::END_HEADERS);
        assert_eq!(&out[9..13], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_encode_settings_and_ack() {
        let mut out = BytesMut::new();
        FrameCodec::encode_settings_frame(&SettingsFrame::new(vec![(1, 8192), (4, 65535)]), &mut out);
        assert_eq!(&out[0..3], &[0, 0, 12]);
        assert_eq!(&out[5..9], &[0, 0, 0, 0]);

        let mut out = BytesMut::new();
        FrameCodec::encode_settings_frame(&SettingsFrame::ack(), &mut out);
        assert_eq!(&out[..], &[0, 0, 0, 0x4, 0x1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_rst_stream_and_goaway() {
        let mut out = BytesMut::new();
        FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(3, ErrorCode::ProtocolError), &mut out);
        assert_eq!(&out[9..], &[0, 0, 0, 1]);

        let mut out = BytesMut::new();
        FrameCodec::encode_goaway_frame(
            &GoawayFrame::new(7, ErrorCode::NoError, Bytes::new()),
            &mut out,
        );
        assert_eq!(&out[0..3], &[0, 0, 8]);
        assert_eq!(&out[9..13], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_encode_window_update() {
        let mut out = BytesMut::new();
        FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(42, 1000), &mut out);

        assert_eq!(&out[0..3], &[0, 0, 4]);
        assert_eq!(&out[5..9], &[0, 0, 0, 42]);
        assert_eq!(u32::from_be_bytes([out[9], out[10], out[11], out[12]]), 1000);
    }
}
