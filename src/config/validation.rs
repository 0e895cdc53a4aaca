//! Semantic configuration checks
//!
//! Serde handles syntax; this pass checks values and ranges and reports
//! every problem at once.

use super::schema::ServerConfig;
use crate::security::ip_filter::IpNet;
use std::net::SocketAddr;

/// One rejected configuration value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        ValidationError {
            field,
            message: message.into(),
        }
    }
}

/// Validate a configuration, collecting every error
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be at least 1"));
    }

    let limits = &config.limits;
    for (field, value) in [
        ("limits.max_header_name", limits.max_header_name),
        ("limits.max_header_value", limits.max_header_value),
        ("limits.max_headers", limits.max_headers),
        ("limits.max_request_line", limits.max_request_line),
        ("limits.pipeline_burst", limits.pipeline_burst),
        ("limits.max_requests_per_connection", limits.max_requests_per_connection),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be at least 1"));
        }
    }
    if limits.max_head < limits.max_request_line {
        errors.push(ValidationError::new(
            "limits.max_head",
            "must not be smaller than limits.max_request_line",
        ));
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.read_ms", timeouts.read_ms),
        ("timeouts.keep_alive_ms", timeouts.keep_alive_ms),
        ("timeouts.write_ms", timeouts.write_ms),
        ("timeouts.tls_handshake_ms", timeouts.tls_handshake_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.workers.pool_size == 0 {
        errors.push(ValidationError::new("workers.pool_size", "must be at least 1"));
    }
    if config.workers.channel_capacity == 0 {
        errors.push(ValidationError::new("workers.channel_capacity", "must be at least 1"));
    }

    if config.http2.enabled {
        if let Err(e) = config.http2.settings() {
            errors.push(ValidationError::new("http2", e.to_string()));
        }
    }

    for (field, entries) in [
        ("security.ip_whitelist", &config.security.ip_whitelist),
        ("security.ip_blacklist", &config.security.ip_blacklist),
    ] {
        for entry in entries {
            if entry.parse::<IpNet>().is_err() {
                errors.push(ValidationError::new(
                    field,
                    format!("'{}' is not an address or CIDR range", entry),
                ));
            }
        }
    }

    if let Some(rate_limit) = &config.security.rate_limit {
        if !(rate_limit.rate > 0.0 && rate_limit.rate.is_finite()) {
            errors.push(ValidationError::new("security.rate_limit.rate", "must be positive"));
        }
        if rate_limit.burst == 0 {
            errors.push(ValidationError::new("security.rate_limit.burst", "must be at least 1"));
        }
        if rate_limit.max_entries == 0 {
            errors.push(ValidationError::new(
                "security.rate_limit.max_entries",
                "must be at least 1",
            ));
        }
    }

    if let Some(cors) = &config.security.cors {
        if cors.allowed_origins.is_empty() {
            errors.push(ValidationError::new(
                "security.cors.allowed_origins",
                "must list at least one origin",
            ));
        }
    }

    let observability = &config.observability;
    for path in observability
        .health_paths
        .iter()
        .chain(std::iter::once(&observability.metrics_path))
    {
        if !path.starts_with('/') {
            errors.push(ValidationError::new(
                "observability",
                format!("endpoint path '{}' must start with '/'", path),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn test_bad_cidr_rejected() {
        let mut config = ServerConfig::default();
        config.security.ip_blacklist = vec!["10.0.0.0/8".into(), "10.0.0.0/33".into()];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "security.ip_blacklist");
    }

    #[test]
    fn test_rate_limit_ranges() {
        let mut config = ServerConfig::default();
        config.security.rate_limit = Some(RateLimitConfig {
            rate: 0.0,
            burst: 0,
            ..RateLimitConfig::default()
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_invalid_http2_frame_size() {
        let mut config = ServerConfig::default();
        config.http2.max_frame_size = 100;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "http2");

        config.http2.enabled = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_endpoint_paths_must_be_absolute() {
        let mut config = ServerConfig::default();
        config.observability.metrics_path = "metrics".into();
        assert!(validate_config(&config).is_err());
    }
}
