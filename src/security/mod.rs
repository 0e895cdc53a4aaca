//! Security hooks
//!
//! Consulted by the server before any per-connection state exists:
//!
//! ```text
//! accept(addr) → IpPolicy::is_allowed   → 403 Forbidden
//!              → RateLimitPolicy::is_allowed → 429 Too Many Requests
//!              → connection served; CorsPolicy decorates every response
//! ```
//!
//! Each hook is a trait so deployments can plug in their own engine; the
//! defaults here are built from [`SecurityConfig`](crate::config::SecurityConfig).
//! Only the hook state (token buckets) is shared across connections.

pub mod cors;
pub mod ip_filter;
pub mod rate_limit;

pub use cors::Cors;
pub use ip_filter::{IpFilter, IpNet};
pub use rate_limit::RateLimiter;

use crate::config::SecurityConfig;
use crate::http::{Headers, HttpResponse, Request};
use std::net::IpAddr;
use std::sync::Arc;

/// Decides whether a client address may connect at all
pub trait IpPolicy: Send + Sync {
    fn is_allowed(&self, addr: IpAddr) -> bool;
}

/// Decides whether a client address is within its request budget
pub trait RateLimitPolicy: Send + Sync {
    fn is_allowed(&self, addr: IpAddr) -> bool;
}

/// Cross-origin response decoration
pub trait CorsPolicy: Send + Sync {
    /// Add CORS headers to a response for `request`
    fn apply(&self, headers: &mut Headers, request: &Request);

    /// Answer a preflight request directly, if `request` is one
    fn preflight(&self, request: &Request) -> Option<HttpResponse>;
}

/// Outcome of the connection admission checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Forbidden,
    RateLimited,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Forbidden => "ip_filter",
            Verdict::RateLimited => "rate_limit",
        }
    }
}

/// The installed hooks; absent hooks allow everything
#[derive(Clone, Default)]
pub struct SecurityHooks {
    pub ip_filter: Option<Arc<dyn IpPolicy>>,
    pub rate_limiter: Option<Arc<dyn RateLimitPolicy>>,
    pub cors: Option<Arc<dyn CorsPolicy>>,
}

impl SecurityHooks {
    /// Build the default engines from configuration
    ///
    /// Fails on an unparsable address list entry.
    pub fn from_config(config: &SecurityConfig) -> Result<Self, ip_filter::ParseIpNetError> {
        let mut hooks = SecurityHooks::default();

        if !config.ip_whitelist.is_empty() || !config.ip_blacklist.is_empty() {
            let filter = IpFilter::from_lists(&config.ip_whitelist, &config.ip_blacklist)?;
            hooks.ip_filter = Some(Arc::new(filter));
        }
        if let Some(rate_limit) = &config.rate_limit {
            hooks.rate_limiter = Some(Arc::new(RateLimiter::from_config(rate_limit)));
        }
        if let Some(cors) = &config.cors {
            hooks.cors = Some(Arc::new(Cors::new(cors.clone())));
        }
        Ok(hooks)
    }

    /// Run the IP filter, then the rate limiter
    pub fn check(&self, addr: IpAddr) -> Verdict {
        if let Some(filter) = &self.ip_filter {
            if !filter.is_allowed(addr) {
                return Verdict::Forbidden;
            }
        }
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.is_allowed(addr) {
                return Verdict::RateLimited;
            }
        }
        Verdict::Allow
    }
}

impl std::fmt::Debug for SecurityHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityHooks")
            .field("ip_filter", &self.ip_filter.is_some())
            .field("rate_limiter", &self.rate_limiter.is_some())
            .field("cors", &self.cors.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    struct DenyAll;

    impl RateLimitPolicy for DenyAll {
        fn is_allowed(&self, _addr: IpAddr) -> bool {
            false
        }
    }

    #[test]
    fn test_no_hooks_allow_everything() {
        let hooks = SecurityHooks::default();
        assert_eq!(hooks.check("10.1.2.3".parse().unwrap()), Verdict::Allow);
    }

    #[test]
    fn test_ip_filter_runs_before_rate_limiter() {
        let config = SecurityConfig {
            ip_blacklist: vec!["10.0.0.0/8".into()],
            ..SecurityConfig::default()
        };
        let mut hooks = SecurityHooks::from_config(&config).unwrap();
        hooks.rate_limiter = Some(Arc::new(DenyAll));

        assert_eq!(hooks.check("10.1.2.3".parse().unwrap()), Verdict::Forbidden);
        assert_eq!(hooks.check("192.168.0.1".parse().unwrap()), Verdict::RateLimited);
    }

    #[test]
    fn test_from_config_builds_rate_limiter() {
        let config = SecurityConfig {
            rate_limit: Some(RateLimitConfig {
                rate: 1.0,
                burst: 1,
                ..RateLimitConfig::default()
            }),
            ..SecurityConfig::default()
        };
        let hooks = SecurityHooks::from_config(&config).unwrap();
        let addr: IpAddr = "127.0.0.1".parse().unwrap();

        assert_eq!(hooks.check(addr), Verdict::Allow);
        assert_eq!(hooks.check(addr), Verdict::RateLimited);
    }
}
