//! API key authentication for the admin API.
//!
//! # Security Features
//!
//! - **Constant-time comparison**: Prevents timing attacks on API key validation
//! - **Brute force protection**: Clients that fail too often are locked out
//!   for a while, even if they then present the right key
//!
//! # Usage
//!
//! Set `ADMIN_API_KEY` to mount the `/admin` routes behind this layer:
//!
//! ```bash
//! ADMIN_API_KEY=your-secret-key cargo run
//! curl -H "X-API-Key: your-secret-key" http://localhost:3000/admin/blocklist
//! ```

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::{ClientIdentity, TrustedProxyConfig, request_identity};

/// Header name for API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Failed attempts allowed per client per minute once the burst is spent.
const AUTH_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

/// Failed attempts a client may make back to back.
const AUTH_FAILURE_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

type AuthFailureLimiter =
    RateLimiter<ClientIdentity, DefaultKeyedStateStore<ClientIdentity>, DefaultClock>;

/// Per-client record of failed admin authentication attempts.
///
/// Shared between the auth layer and the cleanup task, which calls
/// [`purge_stale`](Self::purge_stale) so clients that never return do not
/// stay in memory.
pub struct AuthFailureTracker {
    limiter: AuthFailureLimiter,
    /// Clients that exhausted their failures, with the end of the lockout
    lockouts: DashMap<ClientIdentity, Instant>,
}

impl Default for AuthFailureTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthFailureTracker {
    pub fn new() -> Self {
        let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);
        Self {
            limiter: RateLimiter::keyed(quota),
            lockouts: DashMap::new(),
        }
    }

    /// Remaining lockout for a client, if any.
    fn locked_for(&self, identity: &ClientIdentity) -> Option<Duration> {
        let until = self.lockouts.get(identity).map(|entry| *entry)?;
        let now = Instant::now();
        if until > now {
            return Some(until - now);
        }
        self.lockouts.remove(identity);
        None
    }

    /// Count a failed attempt. Returns the lockout if this one tripped it.
    fn record_failure(&self, identity: &ClientIdentity) -> Option<Duration> {
        match self.limiter.check_key(identity) {
            Ok(()) => None,
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                self.lockouts.insert(identity.clone(), Instant::now() + wait);
                Some(wait)
            }
        }
    }

    /// Forget limiter state for idle clients and drop ended lockouts.
    ///
    /// Returns how many lockouts were removed.
    pub fn purge_stale(&self) -> usize {
        self.limiter.retain_recent();

        let now = Instant::now();
        let before = self.lockouts.len();
        self.lockouts.retain(|_, until| *until > now);
        before.saturating_sub(self.lockouts.len())
    }

    /// Clients currently tracked by the failure limiter.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }
}

/// API key authentication layer for the admin routes.
///
/// # Brute Force Protection
///
/// Failed attempts are counted per client identity. Once a client exceeds
/// them it receives 429 for the lockout period, whatever key it sends.
#[derive(Clone)]
pub struct ApiKeyAuth {
    expected_key: Arc<String>,
    trusted_proxies: TrustedProxyConfig,
    failures: Arc<AuthFailureTracker>,
}

impl ApiKeyAuth {
    pub fn new(
        api_key: String,
        trusted_proxies: TrustedProxyConfig,
        failures: Arc<AuthFailureTracker>,
    ) -> Self {
        Self {
            expected_key: Arc::new(api_key),
            trusted_proxies,
            failures,
        }
    }
}

impl<S> Layer<S> for ApiKeyAuth {
    type Service = ApiKeyAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiKeyAuthService {
            inner,
            expected_key: self.expected_key.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            failures: self.failures.clone(),
        }
    }
}

/// API key authentication service wrapper.
#[derive(Clone)]
pub struct ApiKeyAuthService<S> {
    inner: S,
    expected_key: Arc<String>,
    trusted_proxies: TrustedProxyConfig,
    failures: Arc<AuthFailureTracker>,
}

impl<S> Service<Request<Body>> for ApiKeyAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let expected = self.expected_key.clone();
        let failures = self.failures.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let identity = request_identity(&mut req, &self.trusted_proxies);

        Box::pin(async move {
            if let Some(wait) = failures.locked_for(&identity) {
                let retry_after = wait.as_secs().max(1);
                error!(
                    client_ip = %identity,
                    retry_after_secs = retry_after,
                    "Client locked out after repeated admin auth failures"
                );
                return Ok(locked_out_response(retry_after));
            }

            let rejection = match extract_api_key(&req) {
                Some(provided) if constant_time_eq(provided, &expected) => None,
                Some(_) => Some("Invalid API key"),
                None => Some("API key required"),
            };

            let Some(message) = rejection else {
                debug!(client_ip = %identity, "Admin API key accepted");
                return inner.call(req).await;
            };

            warn!(
                path = %req.uri().path(),
                client_ip = %identity,
                "{message}"
            );

            if let Some(wait) = failures.record_failure(&identity) {
                return Ok(locked_out_response(wait.as_secs().max(1)));
            }
            Ok(unauthorized_response(message))
        })
    }
}

/// API key from the `X-API-Key` header.
fn extract_api_key<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
}

/// Perform constant-time comparison of two strings.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Build an unauthorized (401) response.
fn unauthorized_response(message: &str) -> Response<Body> {
    (
        StatusCode::UNAUTHORIZED,
        [
            (header::WWW_AUTHENTICATE, "API-Key"),
            (header::CONTENT_TYPE, "application/json"),
        ],
        format!(r#"{{"error":"unauthorized","message":"{message}"}}"#),
    )
        .into_response()
}

/// Build a 429 response for a locked-out client.
fn locked_out_response(retry_after: u64) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::RETRY_AFTER, retry_after.to_string()),
            (header::CONTENT_TYPE, "application/json".to_string()),
        ],
        r#"{"error":"too_many_requests","message":"Too many failed authentication attempts. Please wait before retrying."}"#,
    )
        .into_response()
}
