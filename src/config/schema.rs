//! Configuration schema
//!
//! All types derive serde traits for TOML (de)serialization; missing fields
//! take their defaults.

use crate::http::h2::settings::{Settings, SettingsBuilder};
use crate::http::ParserLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listener: ListenerConfig,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutConfig,
    pub workers: WorkerConfig,
    pub http2: Http2Config,
    /// TLS is enabled when this section is present
    pub tls: Option<TlsSettings>,
    pub security: SecurityConfig,
    pub observability: ObservabilityConfig,
}

/// Listening socket
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g. "0.0.0.0:8000")
    pub bind_address: String,

    /// listen(2) backlog
    pub backlog: u32,

    /// Set SO_REUSEPORT so several processes can share the port
    pub reuse_port: bool,

    /// Admission gate size
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".to_string(),
            backlog: 2048,
            reuse_port: false,
            max_connections: 1000,
        }
    }
}

/// Request size ceilings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_header_name: usize,
    pub max_header_value: usize,
    pub max_headers: usize,
    pub max_body: usize,
    pub max_request_line: usize,
    pub max_head: usize,

    /// Requests parsed from one read before responding
    pub pipeline_burst: usize,

    /// Requests served on one connection before it is closed
    pub max_requests_per_connection: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let parser = ParserLimits::default();
        Self {
            max_header_name: parser.max_header_name_len,
            max_header_value: parser.max_header_value_len,
            max_headers: parser.max_headers,
            max_body: parser.max_body_size,
            max_request_line: parser.max_request_line_len,
            max_head: parser.max_head_size,
            pipeline_burst: 20,
            max_requests_per_connection: 1000,
        }
    }
}

impl LimitsConfig {
    pub fn parser_limits(&self) -> ParserLimits {
        ParserLimits {
            max_header_name_len: self.max_header_name,
            max_header_value_len: self.max_header_value,
            max_headers: self.max_headers,
            max_body_size: self.max_body,
            max_request_line_len: self.max_request_line,
            max_head_size: self.max_head,
        }
    }
}

/// Timeouts, in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Waiting for the rest of a request once its first byte arrived
    pub read_ms: u64,

    /// Waiting for the first byte of the next request
    pub keep_alive_ms: u64,

    /// Writing one response buffer
    pub write_ms: u64,

    pub tls_handshake_ms: u64,

    /// How long draining connections may take before being cancelled
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_ms: 10_000,
            keep_alive_ms: 60_000,
            write_ms: 30_000,
            tls_handshake_ms: 10_000,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn tls_handshake(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Application worker pool
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent application invocations
    pub pool_size: usize,

    /// Response events buffered between a worker and its connection
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            channel_capacity: 16,
        }
    }
}

/// HTTP/2 endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http2Config {
    pub enabled: bool,

    /// Accept the client preface on cleartext connections
    pub prior_knowledge: bool,

    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub header_table_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            prior_knowledge: true,
            max_concurrent_streams: 100,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            header_table_size: 4096,
            max_header_list_size: 65_536,
        }
    }
}

impl Http2Config {
    /// Local settings table advertised to clients
    pub fn settings(&self) -> crate::http::h2::Result<Settings> {
        SettingsBuilder::new()
            .max_concurrent_streams(self.max_concurrent_streams)
            .initial_window_size(self.initial_window_size)
            .max_frame_size(self.max_frame_size)
            .header_table_size(self.header_table_size)
            .max_header_list_size(self.max_header_list_size)
            .build()
    }
}

/// Certificate and key locations
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM certificate chain; the built-in development certificate is used when unset
    pub cert_path: Option<String>,

    /// PEM private key; read from `cert_path` when unset
    pub key_path: Option<String>,
}

/// Security hooks
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Addresses or CIDR ranges always allowed
    pub ip_whitelist: Vec<String>,

    /// Addresses or CIDR ranges always rejected
    pub ip_blacklist: Vec<String>,

    pub rate_limit: Option<RateLimitConfig>,

    pub cors: Option<CorsConfig>,
}

/// Token-bucket rate limiting per client address
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens added per second
    pub rate: f64,

    /// Bucket capacity
    pub burst: u32,

    /// Hard cap on tracked clients
    pub max_entries: usize,

    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 100.0,
            burst: 200,
            max_entries: 10_000,
            cleanup_interval_secs: 3600,
        }
    }
}

/// Cross-origin resource sharing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Exact origins, `*`, or `*.example.com`
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()],
            allowed_headers: vec!["Content-Type".to_string()],
            allow_credentials: false,
            max_age_secs: 86_400,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging, metrics and built-in endpoints
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Paths answered with `200 OK` without reaching the application
    pub health_paths: Vec<String>,

    /// Prometheus exposition path
    pub metrics_path: String,

    /// Install the Prometheus recorder
    pub prometheus: bool,

    pub log_format: LogFormat,

    /// Filter directives; `RUST_LOG` takes precedence
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            health_paths: vec!["/health".to_string(), "/-/health".to_string()],
            metrics_path: "/metrics".to_string(),
            prometheus: false,
            log_format: LogFormat::Pretty,
            log_filter: "info".to_string(),
        }
    }
}
