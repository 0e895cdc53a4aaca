//! Chunked transfer encoding support
//!
//! Responses whose length is unknown when their head is written are framed as
//! `<hex-length>\r\n<bytes>\r\n` chunks terminated by `0\r\n\r\n`. Request
//! bodies sent with `Transfer-Encoding: chunked` are decoded incrementally.

use super::{Error, Limit, Result, CRLF};
use bytes::{BufMut, BytesMut};

/// Longest chunk-size line (size plus extensions) accepted from a client
const MAX_CHUNK_LINE_LEN: usize = 1024;

/// Trailer fields accepted after the last chunk unless the caller says otherwise
const MAX_TRAILERS: usize = 100;

/// Terminating zero-length chunk
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Chunked encoder
///
/// Encodes data in HTTP chunked transfer encoding format into any `BufMut`
pub struct ChunkedEncoder<B: BufMut> {
    dst: B,
}

impl<B: BufMut> ChunkedEncoder<B> {
    /// Create a new chunked encoder
    pub fn new(dst: B) -> Self {
        ChunkedEncoder { dst }
    }

    /// Write a chunk of data
    ///
    /// Empty input is skipped: a zero-length chunk would end the body.
    pub fn write_chunk(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        self.dst.put_slice(format!("{:x}{}", data.len(), CRLF).as_bytes());
        self.dst.put_slice(data);
        self.dst.put_slice(CRLF.as_bytes());
    }

    /// Write the final chunk (0-sized chunk)
    pub fn finish(&mut self) {
        self.dst.put_slice(LAST_CHUNK);
    }

    /// Consume the encoder and return the underlying buffer
    pub fn into_inner(self) -> B {
        self.dst
    }
}

/// Chunked decoder
///
/// Decodes HTTP chunked transfer encoding format
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
    chunk_size: usize,
    chunk_read: usize,
    trailers: usize,
    max_trailers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    ChunkSize,
    ChunkData,
    ChunkEnd,
    Trailer,
    Complete,
}

impl ChunkedDecoder {
    /// Create a new chunked decoder
    pub fn new() -> Self {
        Self::with_max_trailers(MAX_TRAILERS)
    }

    /// Decoder that refuses more than `max_trailers` trailer fields
    pub fn with_max_trailers(max_trailers: usize) -> Self {
        ChunkedDecoder {
            state: DecoderState::ChunkSize,
            chunk_size: 0,
            chunk_read: 0,
            trailers: 0,
            max_trailers,
        }
    }

    /// Decode as much of `input` as possible, appending body bytes to `output`
    ///
    /// Returns (bytes_consumed, is_complete)
    pub fn decode(&mut self, input: &[u8], output: &mut BytesMut) -> Result<(usize, bool)> {
        let mut pos = 0;

        loop {
            match self.state {
                DecoderState::ChunkSize => {
                    let Some(crlf_pos) = find_crlf(&input[pos..]) else {
                        if input.len() - pos > MAX_CHUNK_LINE_LEN {
                            return Err(Error::InvalidChunkSize("chunk size line too long".to_string()));
                        }
                        break;
                    };
                    let line = &input[pos..pos + crlf_pos];
                    let size = line.split(|&b| b == b';').next().unwrap_or_default();
                    let size = std::str::from_utf8(size)
                        .map_err(|_| Error::InvalidChunkSize("non-ASCII chunk size".to_string()))?
                        .trim();
                    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
                        return Err(Error::InvalidChunkSize(size.to_string()));
                    }
                    self.chunk_size = usize::from_str_radix(size, 16)
                        .map_err(|_| Error::InvalidChunkSize(size.to_string()))?;

                    pos += crlf_pos + 2;
                    self.chunk_read = 0;
                    self.state = if self.chunk_size == 0 {
                        DecoderState::Trailer
                    } else {
                        DecoderState::ChunkData
                    };
                }

                DecoderState::ChunkData => {
                    let remaining = self.chunk_size - self.chunk_read;
                    let to_copy = remaining.min(input.len() - pos);
                    output.put_slice(&input[pos..pos + to_copy]);
                    pos += to_copy;
                    self.chunk_read += to_copy;

                    if self.chunk_read < self.chunk_size {
                        break;
                    }
                    self.state = DecoderState::ChunkEnd;
                }

                DecoderState::ChunkEnd => {
                    if input.len() - pos < 2 {
                        break;
                    }
                    if &input[pos..pos + 2] != b"\r\n" {
                        return Err(Error::Protocol("Expected CRLF after chunk".to_string()));
                    }
                    pos += 2;
                    self.state = DecoderState::ChunkSize;
                }

                DecoderState::Trailer => {
                    let Some(crlf_pos) = find_crlf(&input[pos..]) else {
                        if input.len() - pos > MAX_CHUNK_LINE_LEN {
                            return Err(Error::Protocol("trailer line too long".to_string()));
                        }
                        break;
                    };
                    pos += crlf_pos + 2;
                    // Trailer fields are skipped; an empty line ends the body.
                    if crlf_pos == 0 {
                        self.state = DecoderState::Complete;
                    } else {
                        self.trailers += 1;
                        if self.trailers > self.max_trailers {
                            return Err(Error::LimitExceeded(Limit::HeaderCount));
                        }
                    }
                }

                DecoderState::Complete => break,
            }
        }

        Ok((pos, self.state == DecoderState::Complete))
    }

    /// Check if decoding is complete
    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Find CRLF in buffer
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<(BytesMut, bool)> {
        let mut decoder = ChunkedDecoder::new();
        let mut output = BytesMut::new();
        let (_, complete) = decoder.decode(input, &mut output)?;
        Ok((output, complete))
    }

    #[test]
    fn test_encode_multiple_chunks() {
        let mut output = BytesMut::new();
        let mut encoder = ChunkedEncoder::new(&mut output);

        encoder.write_chunk(b"Hello");
        encoder.write_chunk(b", ");
        encoder.write_chunk(b"World!");
        encoder.finish();

        assert_eq!(&output[..], b"5\r\nHello\r\n2\r\n, \r\n6\r\nWorld!\r\n0\r\n\r\n");
    }

    #[test]
    fn test_empty_chunks_ignored() {
        let mut encoder = ChunkedEncoder::new(Vec::new());

        encoder.write_chunk(b"");
        encoder.write_chunk(b"Hello");
        encoder.write_chunk(b"");
        encoder.finish();

        assert_eq!(encoder.into_inner(), b"5\r\nHello\r\n0\r\n\r\n");
    }

    #[test]
    fn test_encode_hex_length() {
        let mut encoder = ChunkedEncoder::new(Vec::new());
        encoder.write_chunk(&[b'a'; 300]);
        assert!(encoder.into_inner().starts_with(b"12c\r\n"));
    }

    #[test]
    fn test_decode_multiple_chunks() {
        let (output, complete) = decode_all(b"5\r\nHello\r\n5\r\nWorld\r\n0\r\n\r\n").unwrap();
        assert!(complete);
        assert_eq!(&output[..], b"HelloWorld");
    }

    #[test]
    fn test_decode_with_extension_and_trailer() {
        let (output, complete) =
            decode_all(b"5;name=value\r\nHello\r\n0\r\nX-Trailer: yes\r\n\r\n").unwrap();
        assert!(complete);
        assert_eq!(&output[..], b"Hello");
    }

    #[test]
    fn test_decoder_incremental() {
        let input = b"5\r\nHello\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut output = BytesMut::new();
        let mut buffered = Vec::new();

        for piece in input.chunks(3) {
            buffered.extend_from_slice(piece);
            let (consumed, _) = decoder.decode(&buffered, &mut output).unwrap();
            buffered.drain(..consumed);
        }

        assert!(decoder.is_complete());
        assert_eq!(&output[..], b"Hello");
    }

    #[test]
    fn test_trailer_count_is_bounded() {
        let mut input = b"3\r\nabc\r\n0\r\n".to_vec();
        for i in 0..3 {
            input.extend_from_slice(format!("X-Trailer-{}: v\r\n", i).as_bytes());
        }
        input.extend_from_slice(b"\r\n");

        let mut decoder = ChunkedDecoder::with_max_trailers(2);
        let mut output = BytesMut::new();
        assert!(matches!(
            decoder.decode(&input, &mut output),
            Err(Error::LimitExceeded(Limit::HeaderCount))
        ));

        let mut decoder = ChunkedDecoder::with_max_trailers(3);
        let mut output = BytesMut::new();
        let (consumed, complete) = decoder.decode(&input, &mut output).unwrap();
        assert!(complete);
        assert_eq!(consumed, input.len());
        assert_eq!(&output[..], b"abc");
    }

    #[test]
    fn test_decode_rejects_bad_size() {
        assert!(decode_all(b"zz\r\nHello\r\n0\r\n\r\n").is_err());
        assert!(decode_all(b"\r\n").is_err());
    }

    #[test]
    fn test_decode_rejects_missing_crlf_after_data() {
        assert!(decode_all(b"5\r\nHelloXX0\r\n\r\n").is_err());
    }
}
