//! Minimal application server
//!
//! Serves a greeting at `/`, a streamed countdown at `/stream` and 404
//! elsewhere. Pass a TOML config path as the first argument to override the
//! defaults.
//!
//! Run with: cargo run --example hello_world -- [appserver.toml]

use appserver::http::Request;
use appserver::lifecycle::spawn_signal_listener;
use appserver::{load_config, observability, BoxError, ResponseBody, Server, ServerConfig, StartResponse};
use bytes::Bytes;

fn app(req: &Request, res: &mut StartResponse) -> Result<ResponseBody, BoxError> {
    match req.path() {
        "/" => {
            res.start("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
            Ok(ResponseBody::from("Hello, world!\n"))
        }
        "/stream" => {
            res.start("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
            Ok(ResponseBody::from_iter(
                (1..=5).rev().map(|n| Bytes::from(format!("{}...\n", n))),
            ))
        }
        _ => {
            res.start("404 Not Found", vec![("Content-Type".into(), "text/plain".into())])?;
            Ok(ResponseBody::from("not found\n"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    observability::init_logging(&config.observability)?;

    let server = Server::builder(config, app).bind().await?;
    tracing::info!(address = %server.local_addr()?, "hello_world ready");

    spawn_signal_listener(server.shutdown_handle());
    server.run().await?;
    Ok(())
}
