//! Security middleware for API authentication and rate limiting.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Requests per minute when `TCO_RATE_LIMIT` is unset.
pub const DEFAULT_RATE_LIMIT: u32 = 100;

/// Security configuration loaded from environment variables.
#[derive(Clone, Debug)]
pub struct SecurityConfig {
    /// API key for Bearer authentication (from TCO_API_KEY)
    pub api_key: Option<String>,
    /// Allowed CORS origins (from TCO_CORS_ORIGINS, comma-separated)
    pub cors_origins: Option<Vec<String>>,
    pub rate_limiter: Option<RateLimiter>,
}

impl SecurityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Rate limiting is only switched on together with an API key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_key = lookup("TCO_API_KEY").filter(|k| !k.trim().is_empty());

        let cors_origins = lookup("TCO_CORS_ORIGINS").map(|s| {
            s.split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect()
        });

        let rate_limit = lookup("TCO_RATE_LIMIT")
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT);

        let rate_limiter = api_key
            .as_ref()
            .map(|_| RateLimiter::new(rate_limit, Duration::from_secs(60)));

        Self {
            api_key,
            cors_origins,
            rate_limiter,
        }
    }

    /// No authentication, permissive CORS (local use and tests).
    pub fn disabled() -> Self {
        Self {
            api_key: None,
            cors_origins: None,
            rate_limiter: None,
        }
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            ..Self::disabled()
        }
    }

    pub fn with_rate_limit(max_requests: u32) -> Self {
        Self {
            rate_limiter: Some(RateLimiter::new(max_requests, Duration::from_secs(60))),
            ..Self::disabled()
        }
    }

    /// Permissive unless origins are configured. Unparseable origins are skipped.
    pub fn cors_layer(&self) -> CorsLayer {
        match &self.cors_origins {
            None => CorsLayer::permissive(),
            Some(origins) => {
                let origins: Vec<HeaderValue> = origins
                    .iter()
                    .filter_map(|o| match o.parse() {
                        Ok(value) => Some(value),
                        Err(_) => {
                            tracing::warn!("Ignoring invalid CORS origin: {}", o);
                            None
                        }
                    })
                    .collect();
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(origins))
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any)
            }
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// In-memory sliding window rate limiter keyed by client IP.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    requests: Arc<Mutex<HashMap<IpAddr, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a request from `ip`. Returns false once the window is full.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut requests = self.requests.lock().expect("rate limiter lock poisoned");
        let entry = requests.entry(ip).or_default();
        entry.retain(|&t| t > cutoff);

        if entry.len() < self.max_requests as usize {
            entry.push(now);
            true
        } else {
            false
        }
    }

    /// Drop clients with no request inside the window. Returns the number of tracked clients left.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        let mut requests = self.requests.lock().expect("rate limiter lock poisoned");

        requests.retain(|_, timestamps| {
            timestamps.retain(|&t| t > cutoff);
            !timestamps.is_empty()
        });
        requests.len()
    }
}

/// Bearer token check. `/health` stays open for health checks.
pub async fn auth_middleware(
    State(config): State<SecurityConfig>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected_key) = &config.api_key else {
        return Ok(next.run(request).await);
    };
    if request.uri().path().ends_with("/health") {
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if token == expected_key => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

pub async fn rate_limit_middleware(
    State(rate_limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = extract_client_ip(&request);

    if rate_limiter.check(ip) {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("Rate limit exceeded for IP: {}", ip);
        Err(StatusCode::TOO_MANY_REQUESTS)
    }
}

/// Client IP from proxy headers, defaulting to loopback.
fn extract_client_ip(request: &Request<Body>) -> IpAddr {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    header("X-Forwarded-For")
        .and_then(|v| v.split(',').next().and_then(|ip| ip.trim().parse().ok()))
        .or_else(|| header("X-Real-IP").and_then(|v| v.trim().parse().ok()))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn rate_limiter_blocks_requests_over_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let ip: IpAddr = "192.168.1.1".parse().unwrap();

        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn rate_limiter_tracks_ips_independently() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(ip1));
        assert!(!limiter.check(ip1));
        assert!(limiter.check(ip2));
    }

    #[test]
    fn cleanup_forgets_idle_clients() {
        let limiter = RateLimiter::new(5, Duration::ZERO);
        limiter.check("10.0.0.1".parse().unwrap());
        assert_eq!(limiter.cleanup(), 0);
    }

    #[test]
    fn env_without_key_disables_auth_and_rate_limit() {
        let config = SecurityConfig::from_lookup(lookup(&[("TCO_RATE_LIMIT", "5")]));
        assert!(config.api_key.is_none());
        assert!(config.rate_limiter.is_none());
    }

    #[test]
    fn env_with_key_enables_rate_limit() {
        let config = SecurityConfig::from_lookup(lookup(&[
            ("TCO_API_KEY", "secret"),
            ("TCO_CORS_ORIGINS", "https://a.example, https://b.example,"),
        ]));
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert!(config.rate_limiter.is_some());
        assert_eq!(
            config.cors_origins,
            Some(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
    }

    #[test]
    fn forwarded_for_wins_over_real_ip() {
        let request = Request::builder()
            .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .header("X-Real-IP", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            extract_client_ip(&request),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
    }
}
