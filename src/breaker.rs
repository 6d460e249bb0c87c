//! Per-endpoint circuit breaker for persistent sessions.
//!
//! ```text
//! CLOSED ──protocol-incompatible failure──► OPEN(until) ──now >= until──► CLOSED
//! ```
//!
//! While an endpoint is open every call to it uses the stateless transport.
//! Transient network errors never trip the breaker.

use crate::Error;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// How long persistent sessions stay disabled after a trip.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Process-wide table of disabled endpoints, keyed by normalized URL.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    disabled: DashMap<String, Instant>,
}

/// Normalize an endpoint URL into a breaker key: scheme, host, explicit
/// port and path without a trailing slash. Query and fragment are dropped.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    match Url::parse(trimmed) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default();
            let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
            let path = url.path().trim_end_matches('/');
            format!("{}://{}{}{}", url.scheme(), host, port, path)
        }
        Err(_) => trimmed.trim_end_matches('/').to_lowercase(),
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The breaker shared by every client in the process.
    pub fn global() -> Arc<CircuitBreaker> {
        static GLOBAL: OnceLock<Arc<CircuitBreaker>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(CircuitBreaker::new())).clone()
    }

    /// Whether persistent sessions are currently disabled for `endpoint`.
    /// An expired entry is cleared on the way.
    pub fn is_open(&self, endpoint: &str) -> bool {
        let key = normalize_endpoint(endpoint);
        let now = Instant::now();
        if self.disabled.remove_if(&key, |_, until| now >= *until).is_some() {
            log::debug!("persistent sessions re-enabled for {}", key);
            return false;
        }
        self.disabled.contains_key(&key)
    }

    pub fn disabled_until(&self, endpoint: &str) -> Option<Instant> {
        let key = normalize_endpoint(endpoint);
        self.disabled
            .get(&key)
            .map(|until| *until)
            .filter(|until| Instant::now() < *until)
    }

    /// Disable persistent sessions for `endpoint` for `cooldown`.
    pub fn trip(&self, endpoint: &str, cooldown: Duration) -> Instant {
        let key = normalize_endpoint(endpoint);
        let until = Instant::now() + cooldown;
        log::warn!(
            "disabling persistent sessions for {} for {}s",
            key,
            cooldown.as_secs()
        );
        self.disabled.insert(key, until);
        until
    }

    /// Trip the breaker if `err` is a protocol incompatibility. Returns
    /// whether it tripped.
    pub fn record_failure(&self, endpoint: &str, err: &Error, cooldown: Duration) -> bool {
        if !err.is_protocol_incompatible() {
            return false;
        }
        self.trip(endpoint, cooldown);
        true
    }

    pub fn reset(&self, endpoint: &str) {
        self.disabled.remove(&normalize_endpoint(endpoint));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(
            normalize_endpoint("WSS://API.Example.com/v1/responses/?x=1"),
            "wss://api.example.com/v1/responses"
        );
        assert_eq!(
            normalize_endpoint("ws://localhost:8080/ws"),
            "ws://localhost:8080/ws"
        );
        assert_eq!(normalize_endpoint("not a url/"), "not a url");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_and_recover() {
        let breaker = CircuitBreaker::new();
        let endpoint = "wss://api.example.com/v1/responses";
        assert!(!breaker.is_open(endpoint));

        let err = Error::closed(Some(1008), "policy violation");
        assert!(breaker.record_failure(endpoint, &err, Duration::from_secs(60)));
        assert!(breaker.is_open(endpoint));
        assert!(breaker.is_open("wss://API.example.com/v1/responses/"));
        assert!(breaker.disabled_until(endpoint).is_some());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breaker.is_open(endpoint));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!breaker.is_open(endpoint));
        assert!(breaker.disabled_until(endpoint).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_do_not_trip() {
        let breaker = CircuitBreaker::new();
        let endpoint = "wss://api.example.com/v1/responses";

        assert!(!breaker.record_failure(endpoint, &Error::timeout(), DEFAULT_COOLDOWN));
        assert!(!breaker.record_failure(
            endpoint,
            &Error::closed(Some(1006), "abnormal"),
            DEFAULT_COOLDOWN
        ));
        assert!(!breaker.is_open(endpoint));
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoints_are_independent() {
        let breaker = CircuitBreaker::new();
        breaker.trip("wss://a.example.com/ws", DEFAULT_COOLDOWN);
        assert!(breaker.is_open("wss://a.example.com/ws"));
        assert!(!breaker.is_open("wss://b.example.com/ws"));

        breaker.reset("wss://a.example.com/ws");
        assert!(!breaker.is_open("wss://a.example.com/ws"));
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&CircuitBreaker::global(), &CircuitBreaker::global()));
    }
}
