//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Service status and gate configuration
//! - `GET /ready` - Kubernetes-compatible readiness probe
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Always 200, includes details
//! - **Readiness** (`/ready`): 503 while a gate store does not answer

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::middleware::ip::ClientIdentity;
use crate::models::{GateStatus, HealthResponse};
use crate::route_class::RouteClass;
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "gates": { "ip_filter": true, "rate_limit": true, "fail_mode": "open" },
///   "forwarding": true,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = &state.config;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        gates: GateStatus {
            ip_filter: config.ip_filter_enabled,
            rate_limit: config.rate_limit_enabled,
            fail_mode: config.gate_fail_mode.to_string(),
        },
        forwarding: config.forwarding_enabled(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// Probes both gate stores with a read that changes nothing. Returns
/// 503 Service Unavailable if either fails or times out.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    let probe = ClientIdentity::unknown();

    if let Err(e) = state.ip_filter.is_ip_blocked(&probe).await {
        warn!(error = %e, "Readiness: block list store not answering");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    if let Err(e) = state.quota.status(&probe, RouteClass::Default).await {
        warn!(error = %e, "Readiness: quota store not answering");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    StatusCode::OK
}
