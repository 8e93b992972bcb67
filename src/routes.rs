//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets / propagates X-Request-Id
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    IP Filter     │ ← 403 if blocked
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded, X-RateLimit-* otherwise
//! └────────┬─────────┘
//!          ▼
//!      Handler (admin routes add API key auth)
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Health & monitoring
//! - `/admin/*` - Block list, security events, quotas (needs `ADMIN_API_KEY`)
//! - everything else - forwarded to `UPSTREAM_URL`, or 404

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{self, admin};
use crate::middleware::{ApiKeyAuth, IpFilterLayer, RateLimitError, RateLimitLayer};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// # Middleware Configuration
///
/// - **IP Filter**: Enabled by `IP_FILTER_ENABLED`
/// - **Rate Limiting**: Enabled by `RATE_LIMIT_ENABLED`
/// - **Admin API**: Mounted if `ADMIN_API_KEY` is set
/// - **CORS**: Configured from `CORS_ALLOWED_ORIGINS`
///
/// # Errors
///
/// Returns `RateLimitError` if rate limiting configuration is invalid.
pub fn build_router(state: AppState) -> Result<Router, RateLimitError> {
    let config = &state.config;

    let cors = build_cors_layer(&config.cors_allowed_origins);

    // =========================================================================
    // Build Router with Routes
    // =========================================================================
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check));

    if let Some(api_key) = &config.admin_api_key {
        info!("Admin API enabled under /admin");
        router = router.nest("/admin", admin_router(api_key.clone(), &state));
    } else {
        info!("Admin API disabled (no ADMIN_API_KEY set)");
    }

    if let Some(upstream) = &config.upstream_url {
        info!(upstream = %upstream, "Forwarding admitted requests upstream");
    }
    router = router.fallback(handlers::forward);

    // =========================================================================
    // Apply Middleware Stack (order matters - last added runs first)
    // =========================================================================

    // 1. Request body size limit (prevents DoS via large payloads)
    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Rate limiting
    if config.rate_limit_enabled {
        info!(
            window_secs = config.rate_limit_window.as_secs(),
            auth = config.route_limits.auth,
            payment = config.route_limits.payment,
            api = config.route_limits.api,
            default = config.route_limits.default,
            trusted_proxies = config.trusted_proxies.len(),
            "Rate limiting enabled"
        );
        router = router.layer(RateLimitLayer::new(
            state.quota.clone(),
            state.security.clone(),
            state.trusted_proxies.clone(),
            config.gate_fail_mode,
        )?);
    } else {
        info!("Rate limiting disabled (RATE_LIMIT_ENABLED=false)");
    }

    // 3. IP filter, runs before the rate limiter
    if config.ip_filter_enabled {
        info!(fail_mode = %config.gate_fail_mode, "IP filtering enabled");
        router = router.layer(IpFilterLayer::new(
            state.ip_filter.clone(),
            state.security.clone(),
            state.trusted_proxies.clone(),
            config.gate_fail_mode,
        ));
    } else {
        info!("IP filtering disabled (IP_FILTER_ENABLED=false)");
    }

    // 4. CORS
    router = router.layer(cors);

    // 5. Tracing, inside the request ID layers so spans see the ID
    router = router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    Ok(router.with_state(state))
}

/// Admin routes behind API key authentication.
fn admin_router(api_key: String, state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/blocklist",
            get(admin::list_blocked)
                .post(admin::block)
                .delete(admin::unblock),
        )
        .route("/security-events", get(admin::security_events))
        .route(
            "/quota",
            get(admin::quota_status).delete(admin::reset_quota),
        )
        .layer(ApiKeyAuth::new(
            api_key,
            state.trusted_proxies.clone(),
            state.auth_failures.clone(),
        ))
}

/// Build CORS layer from configuration.
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
