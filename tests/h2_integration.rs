//! HTTP/2 prior-knowledge over loopback
//!
//! The client side is hand-rolled from the crate's own frame codec and the
//! hpack crate, so every frame on the wire is visible to the test.

mod common;

use appserver::http::h2::codec::FrameCodec;
use appserver::http::h2::{
    DataFrame, Frame, FrameType, HeadersFrame, SettingsFrame, CONNECTION_PREFACE,
};
use appserver::http::Request;
use appserver::{BoxError, ResponseBody, StartResponse};
use bytes::{Bytes, BytesMut};
use common::{start, test_config, IO_TIMEOUT};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Client {
    stream: TcpStream,
    codec: FrameCodec,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut preface = BytesMut::from(CONNECTION_PREFACE);
        FrameCodec::encode_settings_frame(&SettingsFrame::new(vec![]), &mut preface);
        stream.write_all(&preface).await.unwrap();

        Client {
            stream,
            codec: FrameCodec::new(1 << 24),
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    async fn send_headers(&mut self, id: u32, fields: &[(&str, &str)], end_stream: bool) {
        let block = self
            .encoder
            .encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        let mut buf = BytesMut::new();
        FrameCodec::encode_headers_frame(
            &HeadersFrame::new(id, Bytes::from(block), end_stream, true),
            16384,
            &mut buf,
        );
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn send_data(&mut self, id: u32, data: &'static [u8], end_stream: bool) {
        let mut buf = BytesMut::new();
        FrameCodec::encode_data_frame(&DataFrame::new(id, Bytes::from_static(data), end_stream), &mut buf);
        self.stream.write_all(&buf).await.unwrap();
    }

    /// Read frames until `done` holds for the last one, or the peer closes
    async fn read_until(&mut self, done: impl Fn(&Frame) -> bool) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 16384];
        loop {
            while let Some(frame) = self.codec.decode().unwrap() {
                let finished = done(&frame);
                frames.push(frame);
                if finished {
                    return frames;
                }
            }
            let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("server went quiet")
                .unwrap();
            if n == 0 {
                return frames;
            }
            self.codec.extend(&buf[..n]);
        }
    }

    fn decode(&mut self, block: &[u8]) -> Vec<(String, String)> {
        self.decoder
            .decode(block)
            .unwrap()
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n).unwrap(),
                    String::from_utf8(v).unwrap(),
                )
            })
            .collect()
    }
}

fn is_end_of(id: u32) -> impl Fn(&Frame) -> bool {
    move |frame| {
        frame.stream_id == id
            && frame.flags.is_end_stream()
            && matches!(frame.frame_type(), Some(FrameType::Data | FrameType::Headers))
    }
}

fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn test_headers_then_data_is_one_request() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let app = move |req: &Request, res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
        counted.fetch_add(1, Ordering::SeqCst);
        res.start("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
        Ok(ResponseBody::from(req.body().to_vec()))
    };
    let server = start(test_config(), app).await;
    let mut client = Client::connect(server.addr).await;

    client
        .send_headers(
            1,
            &[
                (":method", "POST"),
                (":scheme", "http"),
                (":path", "/echo"),
                (":authority", "localhost"),
            ],
            false,
        )
        .await;
    client.send_data(1, b"ping", true).await;

    let frames = client.read_until(is_end_of(1)).await;
    let on_stream: Vec<&Frame> = frames.iter().filter(|f| f.stream_id == 1).collect();
    assert_eq!(on_stream.len(), 2);
    assert_eq!(on_stream[0].frame_type(), Some(FrameType::Headers));
    assert_eq!(on_stream[1].frame_type(), Some(FrameType::Data));

    let head = HeadersFrame::parse(on_stream[0]).unwrap();
    let fields = client.decode(&head.header_block);
    assert_eq!(field(&fields, ":status"), Some("200"));
    assert_eq!(field(&fields, "content-type"), Some("text/plain"));
    assert_eq!(DataFrame::parse(on_stream[1]).unwrap().data, Bytes::from_static(b"ping"));

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_streams_share_connection() {
    let app = |req: &Request, res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
        res.start("200 OK", vec![])?;
        Ok(ResponseBody::from(req.path().to_string()))
    };
    let server = start(test_config(), app).await;
    let mut client = Client::connect(server.addr).await;

    for (id, path) in [(1, "/a"), (3, "/b"), (5, "/c")] {
        client
            .send_headers(
                id,
                &[
                    (":method", "GET"),
                    (":scheme", "http"),
                    (":path", path),
                    (":authority", "localhost"),
                ],
                true,
            )
            .await;
    }

    let mut bodies = std::collections::HashMap::new();
    while bodies.len() < 3 {
        let batch = client
            .read_until(|f| f.frame_type() == Some(FrameType::Data) && f.flags.is_end_stream())
            .await;
        assert!(!batch.is_empty(), "connection closed early");
        for frame in &batch {
            if frame.frame_type() == Some(FrameType::Data) {
                let data = DataFrame::parse(frame).unwrap();
                bodies.insert(frame.stream_id, data.data);
            }
        }
    }

    assert_eq!(bodies[&1], Bytes::from_static(b"/a"));
    assert_eq!(bodies[&3], Bytes::from_static(b"/b"));
    assert_eq!(bodies[&5], Bytes::from_static(b"/c"));

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_push_promise_precedes_response() {
    let app = |req: &Request, res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
        match req.path() {
            "/" => {
                res.push("/style.css");
                res.start("200 OK", vec![("Content-Type".into(), "text/html".into())])?;
                Ok(ResponseBody::from("<html></html>"))
            }
            _ => {
                res.start("200 OK", vec![("Content-Type".into(), "text/css".into())])?;
                Ok(ResponseBody::from("body{}"))
            }
        }
    };
    let server = start(test_config(), app).await;
    let mut client = Client::connect(server.addr).await;

    client
        .send_headers(
            1,
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "localhost"),
            ],
            true,
        )
        .await;

    let mut frames = client.read_until(is_end_of(1)).await;
    let pushed_done = frames.iter().any(is_end_of(2));
    if !pushed_done {
        frames.extend(client.read_until(is_end_of(2)).await);
    }

    let promise_at = frames
        .iter()
        .position(|f| f.frame_type() == Some(FrameType::PushPromise))
        .expect("no PUSH_PROMISE");
    let head_at = frames
        .iter()
        .position(|f| f.stream_id == 1 && f.frame_type() == Some(FrameType::Headers))
        .expect("no response HEADERS");
    assert!(promise_at < head_at);

    let promise = &frames[promise_at];
    assert_eq!(promise.stream_id, 1);
    let promised = u32::from_be_bytes(promise.payload[..4].try_into().unwrap()) & 0x7FFF_FFFF;
    assert_eq!(promised, 2);

    // Header blocks share one dynamic table, so decode them in wire order.
    let mut pushed_path = None;
    let mut pushed_type = None;
    for frame in &frames {
        match frame.frame_type() {
            Some(FrameType::PushPromise) => {
                let fields = client.decode(&frame.payload[4..]);
                pushed_path = field(&fields, ":path").map(str::to_string);
            }
            Some(FrameType::Headers) => {
                let head = HeadersFrame::parse(frame).unwrap();
                let fields = client.decode(&head.header_block);
                if frame.stream_id == 2 {
                    pushed_type = field(&fields, "content-type").map(str::to_string);
                }
            }
            _ => {}
        }
    }
    assert_eq!(pushed_path.as_deref(), Some("/style.css"));
    assert_eq!(pushed_type.as_deref(), Some("text/css"));

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_drain_sends_goaway_and_closes() {
    let app = |_req: &Request, res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
        res.start("204 No Content", vec![])?;
        Ok(ResponseBody::Empty)
    };
    let server = start(test_config(), app).await;
    let mut client = Client::connect(server.addr).await;

    client
        .send_headers(
            1,
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "localhost"),
            ],
            true,
        )
        .await;
    client.read_until(is_end_of(1)).await;

    server.shutdown.drain();
    let frames = client.read_until(|_| false).await;
    assert!(frames
        .iter()
        .any(|f| f.frame_type() == Some(FrameType::Goaway)));

    tokio::time::timeout(IO_TIMEOUT, server.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
