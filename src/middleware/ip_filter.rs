//! IP filter gate.
//!
//! First gate in the pipeline. Requests whose client identity is on the block
//! list are answered here with `403 Forbidden` and never reach the rate limit
//! gate or any handler:
//!
//! ```text
//! HTTP/1.1 403 Forbidden
//! X-Blocked-Reason: IP_FILTERED
//! Content-Type: text/plain; charset=utf-8
//!
//! Access denied: IP address is blocked
//! ```
//!
//! Every rejection is recorded as an `IP_FILTERED` security event. Admitted
//! requests pass through untouched.

use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::gate::on_store_failure;
use super::ip::{TrustedProxyConfig, request_identity};
use crate::config::FailMode;
use crate::metrics;
use crate::services::{BlockReason, IpFilteringService, SecurityMetricsService};

/// Header naming the reason a request was blocked.
pub const X_BLOCKED_REASON: HeaderName = HeaderName::from_static("x-blocked-reason");

/// Body of the 403 response.
pub const BLOCKED_BODY: &str = "Access denied: IP address is blocked";

const GATE: &str = "ip_filter";

/// Layer that rejects requests from blocked client identities.
///
/// # Example
///
/// ```rust,ignore
/// let layer = IpFilterLayer::new(filter, security, trusted_proxies, FailMode::Open);
/// let app = Router::new()
///     .route("/api/forum", get(handler))
///     .layer(layer);
/// ```
#[derive(Clone)]
pub struct IpFilterLayer {
    filter: IpFilteringService,
    security: SecurityMetricsService,
    trusted_proxies: TrustedProxyConfig,
    fail_mode: FailMode,
}

impl IpFilterLayer {
    pub fn new(
        filter: IpFilteringService,
        security: SecurityMetricsService,
        trusted_proxies: TrustedProxyConfig,
        fail_mode: FailMode,
    ) -> Self {
        Self {
            filter,
            security,
            trusted_proxies,
            fail_mode,
        }
    }
}

impl<S> Layer<S> for IpFilterLayer {
    type Service = IpFilter<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IpFilter {
            inner,
            filter: self.filter.clone(),
            security: self.security.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            fail_mode: self.fail_mode,
        }
    }
}

/// IP filter service wrapper.
#[derive(Clone)]
pub struct IpFilter<S> {
    inner: S,
    filter: IpFilteringService,
    security: SecurityMetricsService,
    trusted_proxies: TrustedProxyConfig,
    fail_mode: FailMode,
}

impl<S> Service<Request<Body>> for IpFilter<S>
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
        let filter = self.filter.clone();
        let security = self.security.clone();
        let fail_mode = self.fail_mode;
        // Take the readied service, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let identity = request_identity(&mut req, &self.trusted_proxies);

        Box::pin(async move {
            let started = Instant::now();
            let verdict = filter.is_ip_blocked(&identity).await;
            metrics::record_gate_duration(GATE, started.elapsed().as_secs_f64());

            match verdict {
                Ok(false) => inner.call(req).await,
                Ok(true) => {
                    let path = req.uri().path();
                    warn!(client_ip = %identity, path = %path, "Blocked request from filtered IP");
                    security.record_blocked_request(BlockReason::IpFiltered, &identity, path);
                    Ok(blocked_response())
                }
                Err(err) => {
                    let path = req.uri().path().to_string();
                    match on_store_failure(GATE, fail_mode, &err, &identity, &path) {
                        Some(response) => Ok(response),
                        None => {
                            debug!(client_ip = %identity, "Admitting request without block-list check");
                            inner.call(req).await
                        }
                    }
                }
            }
        })
    }
}

fn blocked_response() -> Response<Body> {
    (
        StatusCode::FORBIDDEN,
        [(
            X_BLOCKED_REASON,
            HeaderValue::from_static(BlockReason::IpFiltered.as_str()),
        )],
        BLOCKED_BODY,
    )
        .into_response()
}
