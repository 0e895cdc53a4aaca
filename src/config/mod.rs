//! Server configuration
//!
//! ```text
//! appserver.toml
//!     → loader (read + deserialize)
//!     → validation (semantic checks, every error collected)
//!     → ServerConfig (immutable, shared by the server and its connections)
//! ```
//!
//! Every section has defaults, so an empty file is a valid configuration.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    CorsConfig, Http2Config, LimitsConfig, ListenerConfig, LogFormat, ObservabilityConfig,
    RateLimitConfig, SecurityConfig, ServerConfig, TimeoutConfig, TlsSettings, WorkerConfig,
};
pub use validation::{validate_config, ValidationError};
