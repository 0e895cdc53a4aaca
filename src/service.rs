//! Per-request plumbing shared by the HTTP/1.1 and HTTP/2 connections
//!
//! A connection hands every complete request to [`Service::prepare`] and
//! [`Service::respond`], then writes the returned [`ResponseEvent`]s with
//! its own framing. Built-in endpoints (health, metrics) and CORS
//! preflights are answered here without reaching the application.

use crate::app::Application;
use crate::config::{LimitsConfig, ObservabilityConfig, TimeoutConfig};
use crate::http::h2::Settings;
use crate::http::{Headers, HttpResponse, Method, Request, ResponseHead, Status, Version};
use crate::lifecycle::ShutdownSignal;
use crate::observability::{self, AccessRecord};
use crate::security::CorsPolicy;
use crate::streamer::{DispatchError, ResponseEvent, WorkerPool};
use bytes::Bytes;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Everything a connection needs to serve requests
pub struct Service {
    app: Arc<dyn Application>,
    workers: WorkerPool,
    cors: Option<Arc<dyn CorsPolicy>>,
    health_paths: Vec<String>,
    metrics_path: String,
    prometheus: Option<PrometheusHandle>,
    pub(crate) limits: LimitsConfig,
    pub(crate) timeouts: TimeoutConfig,
    /// Local HTTP/2 settings; None when HTTP/2 is disabled
    pub(crate) h2_settings: Option<Settings>,
}

impl Service {
    pub fn new(app: Arc<dyn Application>, workers: WorkerPool) -> Self {
        let observability = ObservabilityConfig::default();
        Service {
            app,
            workers,
            cors: None,
            health_paths: observability.health_paths,
            metrics_path: observability.metrics_path,
            prometheus: None,
            limits: LimitsConfig::default(),
            timeouts: TimeoutConfig::default(),
            h2_settings: Some(Settings::default()),
        }
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_http2(mut self, settings: Option<Settings>) -> Self {
        self.h2_settings = settings;
        self
    }

    pub fn with_cors(mut self, cors: Option<Arc<dyn CorsPolicy>>) -> Self {
        self.cors = cors;
        self
    }

    pub fn with_endpoints(mut self, config: &ObservabilityConfig, prometheus: Option<PrometheusHandle>) -> Self {
        self.health_paths = config.health_paths.clone();
        self.metrics_path = config.metrics_path.clone();
        self.prometheus = prometheus;
        self
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Stamp the request with its id and capture what the response needs
    pub fn prepare(&self, request: &mut Request, peer: SocketAddr) -> RequestMeta {
        request.set_remote_addr(peer);
        let request_id = observability::ensure_request_id(request);

        let mut extra_headers = Headers::new();
        if let Some(cors) = &self.cors {
            cors.apply(&mut extra_headers, request);
        }

        RequestMeta {
            method: request.method(),
            path: request.path().to_string(),
            version: request.version(),
            keep_alive: request.keep_alive(),
            request_id,
            peer,
            started: Instant::now(),
            extra_headers,
        }
    }

    /// Produce the response events for a prepared request
    pub async fn respond(&self, request: Request, shutdown: &ShutdownSignal) -> mpsc::Receiver<ResponseEvent> {
        if let Some(response) = self.intercept(&request) {
            return canned(response);
        }

        match self.workers.dispatch(self.app.clone(), request, shutdown).await {
            Ok(events) => events,
            Err(DispatchError::ShuttingDown | DispatchError::Closed) => {
                canned(HttpResponse::text(Status::SERVICE_UNAVAILABLE, "Service Unavailable"))
            }
        }
    }

    /// Built-in endpoints and CORS preflight
    fn intercept(&self, request: &Request) -> Option<HttpResponse> {
        let path = request.path();
        if matches!(request.method(), Method::Get | Method::Head) {
            if self.health_paths.iter().any(|p| p == path) {
                return Some(HttpResponse::text(Status::OK, "OK"));
            }
            if path == self.metrics_path {
                if let Some(handle) = &self.prometheus {
                    return Some(
                        HttpResponse::builder()
                            .header("Content-Type", "text/plain; version=0.0.4")
                            .body(handle.render())
                            .build(),
                    );
                }
            }
        }

        self.cors.as_ref().and_then(|cors| cors.preflight(request))
    }
}

/// Events of a response that is already complete
pub fn canned(response: HttpResponse) -> mpsc::Receiver<ResponseEvent> {
    let (head, body) = response.into_parts();
    let (tx, rx) = mpsc::channel(2);
    let _ = tx.try_send(ResponseEvent::Head { head, push: Vec::new() });
    let _ = if body.is_empty() {
        tx.try_send(ResponseEvent::End)
    } else {
        tx.try_send(ResponseEvent::Chunk { data: body, last: true })
    };
    rx
}

/// What a connection remembers about a request while its response runs
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub keep_alive: bool,
    pub request_id: String,
    pub peer: SocketAddr,
    pub started: Instant,
    extra_headers: Headers,
}

impl RequestMeta {
    /// Add the request id and CORS headers to a response head
    pub fn decorate(&self, head: &mut ResponseHead) {
        for (name, value) in self.extra_headers.iter() {
            head.headers.insert(name, value);
        }
        head.headers.insert("X-Request-ID", self.request_id.clone());
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::Head
    }

    /// Emit the access log entry for the finished exchange
    pub fn log_access(&self, status: u16, bytes_sent: u64, protocol: &'static str) {
        observability::log_access(&AccessRecord {
            method: self.method,
            path: &self.path,
            status,
            bytes_sent,
            duration: self.started.elapsed(),
            client: self.peer,
            request_id: &self.request_id,
            protocol,
        });
    }
}

/// Body bytes of a canned response, for tests
#[cfg(test)]
pub(crate) async fn drain(mut rx: mpsc::Receiver<ResponseEvent>) -> (Option<ResponseHead>, Bytes) {
    let mut head = None;
    let mut body = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            ResponseEvent::Head { head: h, .. } => head = Some(h),
            ResponseEvent::Chunk { data, last } => {
                body.extend_from_slice(&data);
                if last {
                    break;
                }
            }
            ResponseEvent::End | ResponseEvent::Failed { .. } => break,
        }
    }
    (head, Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{BoxError, ResponseBody, StartResponse};
    use crate::config::CorsConfig;
    use crate::lifecycle::Shutdown;
    use crate::security::Cors;

    fn service() -> Service {
        let app = |_: &Request, res: &mut StartResponse| -> Result<ResponseBody, BoxError> {
            res.start("200 OK", vec![])?;
            Ok("from app".into())
        };
        Service::new(Arc::new(app), WorkerPool::new(2, 4))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint_bypasses_application() {
        let service = service();
        let shutdown = Shutdown::new();
        let mut request = Request::builder().target("/-/health").header("Host", "x").build();
        service.prepare(&mut request, peer());

        let (head, body) = drain(service.respond(request, &shutdown.subscribe()).await).await;
        assert_eq!(head.unwrap().status, Status::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_metrics_path_without_recorder_reaches_application() {
        let service = service();
        let shutdown = Shutdown::new();
        let request = Request::builder().target("/metrics").header("Host", "x").build();

        let (_, body) = drain(service.respond(request, &shutdown.subscribe()).await).await;
        assert_eq!(body, "from app");
    }

    #[tokio::test]
    async fn test_dispatch_after_terminate_is_503() {
        let service = service();
        let shutdown = Shutdown::new();
        shutdown.terminate();
        let request = Request::builder().target("/").header("Host", "x").build();

        let (head, _) = drain(service.respond(request, &shutdown.subscribe()).await).await;
        assert_eq!(head.unwrap().status, Status::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_decorate_adds_request_id_and_cors() {
        let service = service().with_cors(Some(Arc::new(Cors::new(CorsConfig::default()))));
        let mut request = Request::builder()
            .target("/")
            .header("Host", "x")
            .header("Origin", "https://a.test")
            .build();
        let meta = service.prepare(&mut request, peer());

        let mut head = ResponseHead::new(Status::OK);
        meta.decorate(&mut head);
        assert_eq!(head.headers.get("X-Request-ID"), Some(meta.request_id.as_str()));
        assert_eq!(head.headers.get("Access-Control-Allow-Origin"), Some("*"));
        assert_eq!(request.remote_addr(), Some(peer()));
    }
}
