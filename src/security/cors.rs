//! Cross-origin resource sharing
//!
//! Origins match exactly, through `*`, or through a `*.example.com`
//! subdomain pattern. A matched non-wildcard origin is echoed back with
//! `Vary: Origin`; credentials are only ever allowed for such origins.

use super::CorsPolicy;
use crate::config::CorsConfig;
use crate::http::{Headers, HttpResponse, Method, Request, Status};

#[derive(Debug, Clone)]
pub struct Cors {
    config: CorsConfig,
    methods: String,
    headers: String,
}

impl Cors {
    pub fn new(config: CorsConfig) -> Self {
        let methods = config.allowed_methods.join(",");
        let headers = config.allowed_headers.join(",");
        Cors {
            config,
            methods,
            headers,
        }
    }

    fn allows_any_origin(&self) -> bool {
        self.config.allowed_origins.iter().any(|o| o == "*")
    }

    /// Value for Access-Control-Allow-Origin, or None when the origin is refused
    pub fn allow_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allows_any_origin() {
            return Some("*".to_string());
        }

        let origin = origin?;
        self.config
            .allowed_origins
            .iter()
            .any(|allowed| origin_matches(allowed, origin))
            .then(|| origin.to_string())
    }
}

fn origin_matches(allowed: &str, origin: &str) -> bool {
    match allowed.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') => origin.ends_with(suffix),
        _ => allowed == origin,
    }
}

impl CorsPolicy for Cors {
    fn apply(&self, headers: &mut Headers, request: &Request) {
        let Some(origin) = self.allow_origin(request.headers().get("Origin")) else {
            return;
        };

        let wildcard = origin == "*";
        headers.insert("Access-Control-Allow-Origin", origin);
        headers.insert("Access-Control-Allow-Methods", self.methods.clone());
        headers.insert("Access-Control-Allow-Headers", self.headers.clone());
        headers.insert("Access-Control-Max-Age", self.config.max_age_secs.to_string());
        if !wildcard {
            if self.config.allow_credentials {
                headers.insert("Access-Control-Allow-Credentials", "true");
            }
            headers.append("Vary", "Origin");
        }
    }

    fn preflight(&self, request: &Request) -> Option<HttpResponse> {
        if request.method() != Method::Options
            || !request.headers().contains("Access-Control-Request-Method")
        {
            return None;
        }

        let mut response = HttpResponse::builder().status(Status::NO_CONTENT).build();
        self.apply(response.headers_mut(), request);
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cors(origins: &[&str], credentials: bool) -> Cors {
        Cors::new(CorsConfig {
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            allow_credentials: credentials,
            ..CorsConfig::default()
        })
    }

    fn request_from(origin: &str) -> Request {
        Request::builder().header("Host", "api").header("Origin", origin).build()
    }

    #[test]
    fn test_wildcard_origin() {
        let cors = cors(&["*"], true);
        let mut headers = Headers::new();
        cors.apply(&mut headers, &request_from("https://a.test"));

        assert_eq!(headers.get("Access-Control-Allow-Origin"), Some("*"));
        assert_eq!(headers.get("Access-Control-Allow-Methods"), Some("GET,POST,OPTIONS"));
        assert!(!headers.contains("Access-Control-Allow-Credentials"));
        assert!(!headers.contains("Vary"));
    }

    #[test]
    fn test_exact_and_subdomain_origins() {
        let cors = cors(&["https://app.test", "*.example.com"], true);

        let mut headers = Headers::new();
        cors.apply(&mut headers, &request_from("https://api.example.com"));
        assert_eq!(
            headers.get("Access-Control-Allow-Origin"),
            Some("https://api.example.com")
        );
        assert_eq!(headers.get("Access-Control-Allow-Credentials"), Some("true"));
        assert_eq!(headers.get("Vary"), Some("Origin"));

        assert_eq!(cors.allow_origin(Some("https://app.test")).as_deref(), Some("https://app.test"));
        assert_eq!(cors.allow_origin(Some("https://evil.test")), None);
        assert_eq!(cors.allow_origin(None), None);
    }

    #[test]
    fn test_refused_origin_gets_no_headers() {
        let cors = cors(&["https://app.test"], false);
        let mut headers = Headers::new();
        cors.apply(&mut headers, &request_from("https://evil.test"));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_preflight() {
        let cors = cors(&["*"], false);
        let preflight = Request::builder()
            .method(Method::Options)
            .target("/api")
            .header("Host", "api")
            .header("Origin", "https://a.test")
            .header("Access-Control-Request-Method", "POST")
            .build();

        let response = cors.preflight(&preflight).unwrap();
        assert_eq!(response.status(), Status::NO_CONTENT);
        assert_eq!(response.headers().get("Access-Control-Max-Age"), Some("86400"));

        assert!(cors.preflight(&request_from("https://a.test")).is_none());
    }
}
