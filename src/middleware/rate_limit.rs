//! Rate limit gate using fixed per-client windows.
//!
//! # Algorithm
//!
//! Each `(client identity, route class)` pair owns a counter that resets when
//! its window elapses. The route class decides the limit:
//!
//! | Path prefix      | Class     | Default limit |
//! |------------------|-----------|---------------|
//! | `/api/auth/`     | `auth`    | 10            |
//! | `/api/payment/`  | `payment` | 20            |
//! | `/api/`          | `api`     | 100           |
//! | anything else    | `default` | 200           |
//!
//! A rejected request does not count against the window, so a client that
//! keeps retrying is admitted again as soon as its window resets.
//!
//! # Response Headers
//!
//! On admitted requests:
//! - `X-RateLimit-Limit`: Limit of the request's route class
//! - `X-RateLimit-Remaining`: Requests left in the current window
//! - `X-RateLimit-Reset`: Seconds until the window resets
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Seconds until the window resets (at least 1)
//!
//! # IP Spoofing Mitigation
//!
//! The client identity honours `X-Forwarded-For` and `X-Real-IP`. Configure
//! `TRUSTED_PROXIES` with your reverse proxy ranges so clients cannot pick
//! their own identity, and make the proxy overwrite (not append) those headers.

use std::fmt;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::gate::on_store_failure;
use super::ip::{TrustedProxyConfig, request_identity};
use crate::config::FailMode;
use crate::metrics;
use crate::route_class::RouteClass;
use crate::services::{BlockReason, QuotaDecision, RateLimitService, SecurityMetricsService};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Body of the 429 response.
pub const RATE_LIMITED_BODY: &str =
    r#"{"error":"Rate limit exceeded","message":"Too many requests. Please try again later."}"#;

const GATE: &str = "rate_limit";

/// Error type for rate limit layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// A route class was configured with a limit of zero.
    ZeroLimit(RouteClass),
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroLimit(class) => write!(
                f,
                "limit for route class '{class}' must be greater than 0; disable the gate instead"
            ),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Rate limiting layer for the Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RateLimitLayer::new(quota, security, trusted_proxies, FailMode::Open)?;
/// let app = Router::new()
///     .route("/api/forum", get(handler))
///     .layer(layer);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    quota: RateLimitService,
    security: SecurityMetricsService,
    trusted_proxies: TrustedProxyConfig,
    fail_mode: FailMode,
}

impl RateLimitLayer {
    /// Create a rate limit layer.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::ZeroLimit` if any route class has a zero limit.
    pub fn new(
        quota: RateLimitService,
        security: SecurityMetricsService,
        trusted_proxies: TrustedProxyConfig,
        fail_mode: FailMode,
    ) -> Result<Self, RateLimitError> {
        if let Some(class) = RouteClass::ALL
            .into_iter()
            .find(|class| quota.limit_for(*class) == 0)
        {
            return Err(RateLimitError::ZeroLimit(class));
        }

        Ok(Self {
            quota,
            security,
            trusted_proxies,
            fail_mode,
        })
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimit {
            inner,
            quota: self.quota.clone(),
            security: self.security.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            fail_mode: self.fail_mode,
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimit<S> {
    inner: S,
    quota: RateLimitService,
    security: SecurityMetricsService,
    trusted_proxies: TrustedProxyConfig,
    fail_mode: FailMode,
}

impl<S> Service<Request<Body>> for RateLimit<S>
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
        let quota = self.quota.clone();
        let security = self.security.clone();
        let fail_mode = self.fail_mode;
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let identity = request_identity(&mut req, &self.trusted_proxies);
        let class = RouteClass::classify(req.uri().path());

        Box::pin(async move {
            let started = Instant::now();
            let checked = quota.check(&identity, class).await;
            metrics::record_gate_duration(GATE, started.elapsed().as_secs_f64());

            let decision = match checked {
                Ok(decision) => decision,
                Err(err) => {
                    let path = req.uri().path().to_string();
                    return match on_store_failure(GATE, fail_mode, &err, &identity, &path) {
                        Some(response) => Ok(response),
                        None => inner.call(req).await,
                    };
                }
            };

            if !decision.allowed {
                let path = req.uri().path();
                let retry_after = decision.reset_after_secs.max(1);

                warn!(
                    client_ip = %identity,
                    path = %path,
                    route_class = %class,
                    retry_after_secs = retry_after,
                    "Rate limit exceeded"
                );
                security.record_blocked_request(BlockReason::RateLimited, &identity, path);

                return Ok(rate_limited_response(retry_after));
            }

            debug!(
                client_ip = %identity,
                route_class = %class,
                remaining = decision.remaining,
                "Request admitted"
            );
            metrics::record_admitted_request(class.as_str());

            let mut response = inner.call(req).await?;
            insert_quota_headers(&mut response, &decision);
            Ok(response)
        })
    }
}

fn insert_quota_headers(response: &mut Response<Body>, decision: &QuotaDecision) {
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_after_secs));
}

fn rate_limited_response(retry_after: u64) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::RETRY_AFTER, HeaderValue::from(retry_after)),
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            ),
        ],
        RATE_LIMITED_BODY,
    )
        .into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::extract::ConnectInfo;
    use tower::ServiceExt;

    use crate::config::RouteLimits;
    use crate::error::StoreError;
    use crate::services::{QuotaStore, WindowKey, WindowState};

    const WINDOW: Duration = Duration::from_secs(60);
    const TIMEOUT: Duration = Duration::from_millis(250);

    fn limits(auth: u32, api: u32) -> RouteLimits {
        RouteLimits {
            auth,
            payment: 20,
            api,
            default: 200,
        }
    }

    fn request(path: &str, peer: &str) -> Request<Body> {
        let addr: SocketAddr = peer.parse().unwrap();
        let mut req = Request::builder().uri(path).body(Body::empty()).unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    fn gate(
        quota: RateLimitService,
        fail_mode: FailMode,
        hits: Arc<AtomicUsize>,
    ) -> (
        SecurityMetricsService,
        impl Service<Request<Body>, Response = Response<Body>, Error = Infallible> + Clone,
    ) {
        let security = SecurityMetricsService::new(16);
        let inner = tower::service_fn(move |_req: Request<Body>| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new(Body::from("ok")))
            }
        });
        let layer = RateLimitLayer::new(
            quota,
            security.clone(),
            TrustedProxyConfig::default(),
            fail_mode,
        )
        .unwrap();
        (security, layer.layer(inner))
    }

    struct BrokenQuotaStore;

    #[async_trait]
    impl QuotaStore for BrokenQuotaStore {
        async fn try_acquire(
            &self,
            _key: &WindowKey,
            _limit: u32,
            _window: Duration,
        ) -> Result<WindowState, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn peek(
            &self,
            _key: &WindowKey,
            _window: Duration,
        ) -> Result<Option<WindowState>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn reset(&self, _key: &WindowKey) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn purge_expired(&self, _window: Duration) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let quota = RateLimitService::in_memory(limits(0, 100), WINDOW, TIMEOUT);
        let result = RateLimitLayer::new(
            quota,
            SecurityMetricsService::new(1),
            TrustedProxyConfig::default(),
            FailMode::Open,
        );
        assert!(matches!(
            result,
            Err(RateLimitError::ZeroLimit(RouteClass::Auth))
        ));
    }

    #[tokio::test]
    async fn test_admitted_request_carries_quota_headers() {
        let quota = RateLimitService::in_memory(limits(10, 100), WINDOW, TIMEOUT);
        let hits = Arc::new(AtomicUsize::new(0));
        let (_, svc) = gate(quota, FailMode::Open, hits.clone());

        let response = svc
            .oneshot(request("/api/forum/posts", "198.51.100.1:4000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[&X_RATELIMIT_LIMIT], "100");
        assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], "99");
        assert_eq!(response.headers()[&X_RATELIMIT_RESET], "60");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_limit_header_reports_route_class_limit() {
        let quota = RateLimitService::in_memory(limits(10, 100), WINDOW, TIMEOUT);
        let (_, svc) = gate(quota, FailMode::Open, Arc::new(AtomicUsize::new(0)));

        let response = svc
            .oneshot(request("/api/auth/login", "198.51.100.1:4000"))
            .await
            .unwrap();

        assert_eq!(response.headers()[&X_RATELIMIT_LIMIT], "10");
        assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], "9");
    }

    #[tokio::test]
    async fn test_over_quota_gets_429_with_fixed_body() {
        let quota = RateLimitService::in_memory(limits(2, 100), WINDOW, TIMEOUT);
        let hits = Arc::new(AtomicUsize::new(0));
        let (security, svc) = gate(quota, FailMode::Open, hits.clone());

        for _ in 0..2 {
            let response = svc
                .clone()
                .oneshot(request("/api/auth/login", "198.51.100.1:4000"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = svc
            .oneshot(request("/api/auth/login", "198.51.100.1:4000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], RATE_LIMITED_BODY.as_bytes());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let events = security.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, BlockReason::RateLimited);
        assert_eq!(events[0].path, "/api/auth/login");
    }

    #[tokio::test]
    async fn test_classes_and_clients_have_separate_windows() {
        let quota = RateLimitService::in_memory(limits(1, 100), WINDOW, TIMEOUT);
        let (_, svc) = gate(quota, FailMode::Open, Arc::new(AtomicUsize::new(0)));

        let first = svc
            .clone()
            .oneshot(request("/api/auth/login", "198.51.100.1:4000"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // Same client, different class
        let other_class = svc
            .clone()
            .oneshot(request("/api/forum", "198.51.100.1:4000"))
            .await
            .unwrap();
        assert_eq!(other_class.status(), StatusCode::OK);

        // Different client, same class
        let other_client = svc
            .clone()
            .oneshot(request("/api/auth/login", "198.51.100.2:4000"))
            .await
            .unwrap();
        assert_eq!(other_client.status(), StatusCode::OK);

        let limited = svc
            .oneshot(request("/api/auth/login", "198.51.100.1:4000"))
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_store_failure_fail_open_admits_without_headers() {
        let quota = RateLimitService::new(Arc::new(BrokenQuotaStore), limits(10, 100), WINDOW, TIMEOUT);
        let hits = Arc::new(AtomicUsize::new(0));
        let (_, svc) = gate(quota, FailMode::Open, hits.clone());

        let response = svc
            .oneshot(request("/api/forum", "198.51.100.1:4000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fail_closed_rejects() {
        let quota = RateLimitService::new(Arc::new(BrokenQuotaStore), limits(10, 100), WINDOW, TIMEOUT);
        let hits = Arc::new(AtomicUsize::new(0));
        let (security, svc) = gate(quota, FailMode::Closed, hits.clone());

        let response = svc
            .oneshot(request("/api/forum", "198.51.100.1:4000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(security.recent_events(10).is_empty());
    }
}
