//! HTTP/1.1 over loopback
//!
//! End-to-end: a bound server, a real TCP client, the application running
//! on the worker pool.

mod common;

use appserver::config::{RateLimitConfig, ServerConfig};
use appserver::http::Request;
use appserver::{BoxError, ResponseBody, StartResponse};
use bytes::Bytes;
use common::{exchange, read_to_close, start, test_config};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

type Seen = Arc<Mutex<Vec<(String, String, Vec<u8>)>>>;

/// Records every request and answers `METHOD PATH`
fn recording_app(seen: Seen) -> impl appserver::Application {
    move |req: &Request, res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
        seen.lock().unwrap().push((
            req.method().as_str().to_string(),
            req.path().to_string(),
            req.body().to_vec(),
        ));
        res.start(
            "200 OK",
            vec![
                ("Content-Type".into(), "text/plain".into()),
                ("X-Handler".into(), "recording".into()),
            ],
        )?;
        Ok(ResponseBody::from(format!("{} {}", req.method().as_str(), req.path())))
    }
}

#[tokio::test]
async fn test_get_root_invokes_application_once() {
    let seen = Seen::default();
    let server = start(test_config(), recording_app(seen.clone())).await;

    let response = exchange(
        server.addr,
        b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("X-Handler: recording\r\n"));
    assert!(response.contains("Content-Length: 5\r\n"));
    assert!(response.ends_with("\r\n\r\nGET /"));

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![("GET".to_string(), "/".to_string(), Vec::new())]);

    server.stop().await;
}

#[tokio::test]
async fn test_post_body_delivered_exactly() {
    let seen = Seen::default();
    let server = start(test_config(), recording_app(seen.clone())).await;

    let response = exchange(
        server.addr,
        b"POST /x HTTP/1.1\r\nHost: localhost\r\nContent-Length: 9\r\nConnection: close\r\n\r\nkey=value",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].2, b"key=value");

    server.stop().await;
}

#[tokio::test]
async fn test_short_body_rejected_before_dispatch() {
    let seen = Seen::default();
    let server = start(test_config(), recording_app(seen.clone())).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"POST /x HTTP/1.1\r\nHost: localhost\r\nContent-Length: 999\r\n\r\nkey=value")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();
    let response = read_to_close(&mut stream).await;

    assert!(response.starts_with("HTTP/1.1 400 "));
    assert!(seen.lock().unwrap().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let seen = Seen::default();
    let server = start(test_config(), recording_app(seen.clone())).await;

    let response = exchange(
        server.addr,
        b"GET /first HTTP/1.1\r\nHost: localhost\r\n\r\n\
          GET /second HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    let first = response.find("GET /first").expect("first response missing");
    let second = response.find("GET /second").expect("second response missing");
    assert!(first < second);
    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);

    server.stop().await;
}

#[tokio::test]
async fn test_streamed_body_is_chunked() {
    let app = |_req: &Request, res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
        res.start("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
        Ok(ResponseBody::from_iter(vec![
            Bytes::from("alpha"),
            Bytes::from("beta"),
            Bytes::from("gamma"),
        ]))
    };
    let server = start(test_config(), app).await;

    let response = exchange(
        server.addr,
        b"GET /stream HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.contains("Transfer-Encoding: chunked\r\n"));
    assert!(!response.contains("Content-Length"));
    assert!(response.ends_with("\r\n\r\n5\r\nalpha\r\n4\r\nbeta\r\n5\r\ngamma\r\n0\r\n\r\n"));

    server.stop().await;
}

#[tokio::test]
async fn test_keep_alive_serves_sequential_requests() {
    let seen = Seen::default();
    let server = start(test_config(), recording_app(seen.clone())).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = vec![0u8; 1024];
    for path in ["/one", "/two"] {
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();

        let expected = format!("GET {}", path);
        let mut response = String::new();
        while !response.ends_with(&expected) {
            let n = tokio::time::timeout(common::IO_TIMEOUT, stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "connection closed between requests");
            response.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }
    assert_eq!(seen.lock().unwrap().len(), 2);

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_health_endpoint_skips_application() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let app = move |_req: &Request, res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
        counted.fetch_add(1, Ordering::SeqCst);
        res.start("200 OK", vec![])?;
        Ok(ResponseBody::Empty)
    };
    let server = start(test_config(), app).await;

    let response = exchange(
        server.addr,
        b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_handler_error_becomes_500() {
    let app = |_req: &Request, _res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
        Err("database unavailable".into())
    };
    let server = start(test_config(), app).await;

    let response = exchange(
        server.addr,
        b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(!response.contains("database unavailable"));

    server.stop().await;
}

#[tokio::test]
async fn test_blacklisted_peer_gets_403() {
    let mut config = test_config();
    config.security.ip_blacklist = vec!["127.0.0.0/8".to_string()];
    let server = start(config, recording_app(Seen::default())).await;

    let response = exchange(server.addr, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(response.contains("Connection: close\r\n"));

    server.stop().await;
}

#[tokio::test]
async fn test_rate_limited_peer_gets_429() {
    let mut config: ServerConfig = test_config();
    config.security.rate_limit = Some(RateLimitConfig {
        rate: 0.01,
        burst: 1,
        ..RateLimitConfig::default()
    });
    let server = start(config, recording_app(Seen::default())).await;

    let request = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    let first = exchange(server.addr, request).await;
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));

    let second = exchange(server.addr, request).await;
    assert!(second.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));

    server.stop().await;
}
