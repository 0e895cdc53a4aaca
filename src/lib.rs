//! appserver - an application server for synchronous request handlers
//!
//! Applications implement [`Application`]: a blocking callable that
//! receives a parsed [`http::Request`], announces status and headers via
//! [`StartResponse`] and returns a [`ResponseBody`]. The server runs it on
//! a bounded worker pool and streams the result back over HTTP/1.1
//! (keep-alive, pipelining, chunked transfer) or HTTP/2 (multiplexed
//! streams, flow control, server push), in cleartext or over TLS.
//!
//! ```no_run
//! use appserver::{ResponseBody, Server, ServerConfig, StartResponse};
//! use appserver::http::Request;
//!
//! # async fn run() -> Result<(), appserver::ServerError> {
//! let app = |_req: &Request, res: &mut StartResponse| -> Result<ResponseBody, appserver::BoxError> {
//!     res.start("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
//!     Ok(ResponseBody::from("Hello, world!"))
//! };
//!
//! let server = Server::builder(ServerConfig::default(), app).bind().await?;
//! appserver::lifecycle::spawn_signal_listener(server.shutdown_handle());
//! server.run().await
//! # }
//! ```

pub mod app;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod security;
pub mod server;
pub mod service;
pub mod streamer;

pub use app::{Application, Body, BoxError, ResponseBody, StartResponse};
pub use config::{load_config, ServerConfig};
pub use server::{Server, ServerBuilder, ServerError};
