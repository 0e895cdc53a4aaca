//! Logging, access log and metrics
//!
//! ```text
//! connections, workers, hooks
//!     → tracing events (structured fields: conn_id, peer, stream_id, request_id)
//!     → access log on target `appserver::access`, one event per request
//!     → metrics facade (counters, gauges, histograms)
//!         → Prometheus recorder, rendered at the metrics endpoint
//! ```

use crate::config::{LogFormat, ObservabilityConfig};
use crate::http::{Method, Request};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const REQUESTS_TOTAL: &str = "appserver_requests_total";
pub const REQUEST_ERRORS_TOTAL: &str = "appserver_request_errors_total";
pub const IN_FLIGHT_REQUESTS: &str = "appserver_in_flight_requests";
pub const REQUEST_DURATION_SECONDS: &str = "appserver_request_duration_seconds";
pub const ACTIVE_CONNECTIONS: &str = "appserver_active_connections";
pub const REJECTED_CONNECTIONS_TOTAL: &str = "appserver_rejected_connections_total";

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the configured filter. Fails if a subscriber is
/// already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
    }
}

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder once per process
///
/// Returns None when another recorder already owns the metrics facade.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "prometheus recorder not installed");
                None
            }
        })
        .clone()
}

/// Use the client's `X-Request-ID`, or assign a fresh one
pub fn ensure_request_id(request: &mut Request) -> String {
    if let Some(id) = request.request_id().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let id = uuid::Uuid::new_v4().to_string();
    request.headers_mut().insert("X-Request-ID", id.clone());
    id
}

/// One finished request
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
    pub method: Method,
    pub path: &'a str,
    pub status: u16,
    pub bytes_sent: u64,
    pub duration: Duration,
    pub client: SocketAddr,
    pub request_id: &'a str,
    pub protocol: &'static str,
}

/// Emit the access log line and request metrics
pub fn log_access(record: &AccessRecord<'_>) {
    tracing::info!(
        target: "appserver::access",
        method = %record.method,
        path = record.path,
        status = record.status,
        bytes = record.bytes_sent,
        duration = record.duration.as_secs_f64(),
        client = %record.client,
        request_id = record.request_id,
        protocol = record.protocol,
        "request completed"
    );

    let status = record.status.to_string();
    metrics::counter!(
        REQUESTS_TOTAL,
        "method" => record.method.as_str(),
        "status" => status,
        "protocol" => record.protocol
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "method" => record.method.as_str())
        .record(record.duration.as_secs_f64());
}

/// Count a request that failed inside the server or the application
pub fn record_error(kind: &'static str) {
    metrics::counter!(REQUEST_ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Count a connection turned away before being served
pub fn record_rejection(reason: &'static str) {
    metrics::counter!(REJECTED_CONNECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Tracks one open connection in the active-connections gauge
#[derive(Debug)]
pub struct ConnectionGauge(());

impl ConnectionGauge {
    pub fn open() -> Self {
        metrics::gauge!(ACTIVE_CONNECTIONS).increment(1.0);
        ConnectionGauge(())
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        metrics::gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
    }
}

/// Tracks one running application invocation
#[derive(Debug)]
pub struct InFlightGauge(());

impl InFlightGauge {
    pub fn start() -> Self {
        metrics::gauge!(IN_FLIGHT_REQUESTS).increment(1.0);
        InFlightGauge(())
    }
}

impl Drop for InFlightGauge {
    fn drop(&mut self) {
        metrics::gauge!(IN_FLIGHT_REQUESTS).decrement(1.0);
    }
}
