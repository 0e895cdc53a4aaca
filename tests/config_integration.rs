//! Configuration files driving a running server

mod common;

use appserver::http::Request;
use appserver::{load_config, BoxError, ResponseBody, Server, ServerError, StartResponse};
use common::{exchange, start};
use std::io::Write;

fn hello(_req: &Request, res: &mut StartResponse) -> Result<ResponseBody, BoxError> {
    res.start("200 OK", vec![])?;
    Ok(ResponseBody::from("hello"))
}

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_limits_from_file_apply() {
    let file = write_config(
        r#"
        [listener]
        bind_address = "127.0.0.1:0"

        [limits]
        max_body = 16

        [timeouts]
        shutdown_grace_ms = 200

        [observability]
        health_paths = ["/ready"]
        "#,
    );
    let config = load_config(file.path()).unwrap();
    let server = start(config, hello).await;

    let too_big = exchange(
        server.addr,
        b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 17\r\n\r\n01234567890123456",
    )
    .await;
    assert!(too_big.starts_with("HTTP/1.1 413 "));

    let ready = exchange(server.addr, b"GET /ready HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
    assert!(ready.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!ready.ends_with("hello"));

    server.stop().await;
}

#[tokio::test]
async fn test_max_requests_per_connection_closes() {
    let file = write_config(
        r#"
        [listener]
        bind_address = "127.0.0.1:0"

        [limits]
        max_requests_per_connection = 2
        "#,
    );
    let config = load_config(file.path()).unwrap();
    let server = start(config, hello).await;

    let response = exchange(
        server.addr,
        b"GET /1 HTTP/1.1\r\nHost: x\r\n\r\nGET /2 HTTP/1.1\r\nHost: x\r\n\r\nGET /3 HTTP/1.1\r\nHost: x\r\n\r\n",
    )
    .await;
    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(response.contains("Connection: close\r\n"));

    server.stop().await;
}

#[tokio::test]
async fn test_tls_without_files_uses_builtin_certificate() {
    let file = write_config(
        r#"
        [listener]
        bind_address = "127.0.0.1:0"

        [tls]
        "#,
    );
    let config = load_config(file.path()).unwrap();
    let server = Server::builder(config, hello).bind().await.unwrap();
    assert_ne!(server.local_addr().unwrap().port(), 0);
}

#[tokio::test]
async fn test_missing_certificate_file_fails_bind() {
    let file = write_config(
        r#"
        [listener]
        bind_address = "127.0.0.1:0"

        [tls]
        cert_path = "/nonexistent/server.pem"
        key_path = "/nonexistent/server.key"
        "#,
    );
    let config = load_config(file.path()).unwrap();
    let result = Server::builder(config, hello).bind().await;
    assert!(matches!(result, Err(ServerError::Tls(_))));
}

#[tokio::test]
async fn test_invalid_blacklist_entry_fails_bind() {
    let mut config = common::test_config();
    config.security.ip_blacklist = vec!["300.1.2.3".to_string()];
    let result = Server::builder(config, hello).bind().await;
    assert!(matches!(result, Err(ServerError::Config(_))));
}
