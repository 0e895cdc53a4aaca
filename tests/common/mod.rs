//! Shared helpers for loopback tests

#![allow(dead_code)]

use appserver::lifecycle::Shutdown;
use appserver::{Application, Server, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback config with small pools and short timeouts
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.workers.pool_size = 4;
    config.timeouts.keep_alive_ms = 2_000;
    config.timeouts.shutdown_grace_ms = 500;
    config
}

pub struct Running {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<(), appserver::ServerError>>,
}

impl Running {
    /// Drain and wait for the accept loop to return
    pub async fn stop(self) {
        self.shutdown.drain();
        tokio::time::timeout(IO_TIMEOUT, self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

pub async fn start(config: ServerConfig, app: impl Application) -> Running {
    let server = Server::builder(config, app).bind().await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());
    Running { addr, shutdown, task }
}

/// Write `request`, then read until the server closes
pub async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    read_to_close(&mut stream).await
}

pub async fn read_to_close(stream: &mut TcpStream) -> String {
    let mut response = Vec::new();
    tokio::time::timeout(IO_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}
