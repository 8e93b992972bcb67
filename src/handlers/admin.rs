//! Admin endpoints for the block list, security events and quotas.
//!
//! Mounted under `/admin` behind [`ApiKeyAuth`](crate::middleware::ApiKeyAuth)
//! when `ADMIN_API_KEY` is set.

use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::middleware::ip::{CidrRange, ClientIdentity, parse_client_addr};
use crate::models::{
    BlockListResponse, BlockRequest, BlockTargetQuery, QuotaQuery, QuotaStatusResponse,
    SecurityEventsQuery, SecurityEventsResponse,
};
use crate::services::BlockEntry;
use crate::state::AppState;

/// Upper bound for one page of security events.
const MAX_EVENTS_PER_PAGE: usize = 1000;

fn parse_target(raw: &str) -> AppResult<CidrRange> {
    CidrRange::parse(raw).ok_or_else(|| {
        AppError::BadRequest(format!("'{raw}' is not an IP address or CIDR range"))
    })
}

fn parse_identity(raw: &str) -> AppResult<ClientIdentity> {
    parse_client_addr(raw)
        .map(ClientIdentity::from)
        .ok_or_else(|| AppError::BadRequest(format!("'{raw}' is not an IP address")))
}

/// List live block-list entries.
///
/// `GET /admin/blocklist`
#[instrument(skip(state))]
pub async fn list_blocked(State(state): State<AppState>) -> AppResult<Json<BlockListResponse>> {
    let entries = state.ip_filter.entries().await?;
    Ok(Json(BlockListResponse {
        count: entries.len(),
        entries,
    }))
}

/// Block an address or range.
///
/// `POST /admin/blocklist`
///
/// ```json
/// { "target": "203.0.113.0/24", "reason": "credential stuffing", "ttl_secs": 3600 }
/// ```
#[instrument(skip(state, payload))]
pub async fn block(
    State(state): State<AppState>,
    payload: Result<Json<BlockRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<BlockEntry>)> {
    let Json(request) = payload?;
    let target = parse_target(&request.target)?;
    if request.reason.trim().is_empty() {
        return Err(AppError::BadRequest("reason cannot be empty".to_string()));
    }
    if request.ttl_secs == Some(0) {
        return Err(AppError::BadRequest(
            "ttl_secs must be greater than 0".to_string(),
        ));
    }

    let entry = state
        .ip_filter
        .block(
            &target,
            request.reason.trim(),
            request.ttl_secs.map(Duration::from_secs),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(entry)))
}

/// Remove a block-list entry.
///
/// `DELETE /admin/blocklist?target=203.0.113.0/24`
#[instrument(skip(state))]
pub async fn unblock(
    State(state): State<AppState>,
    Query(query): Query<BlockTargetQuery>,
) -> AppResult<StatusCode> {
    let target = parse_target(&query.target)?;

    if state.ip_filter.unblock(&target).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("'{target}' is not blocked")))
    }
}

/// Recent rejected requests, newest first.
///
/// `GET /admin/security-events?limit=50`
#[instrument(skip(state))]
pub async fn security_events(
    State(state): State<AppState>,
    Query(query): Query<SecurityEventsQuery>,
) -> Json<SecurityEventsResponse> {
    let events = state
        .security
        .recent_events(query.limit.min(MAX_EVENTS_PER_PAGE));

    Json(SecurityEventsResponse {
        count: events.len(),
        totals: state.security.totals(),
        events,
    })
}

/// Current window of one client for one route class.
///
/// `GET /admin/quota?identity=198.51.100.7&class=auth`
#[instrument(skip(state))]
pub async fn quota_status(
    State(state): State<AppState>,
    Query(query): Query<QuotaQuery>,
) -> AppResult<Json<QuotaStatusResponse>> {
    let identity = parse_identity(&query.identity)?;
    let status = state.quota.status(&identity, query.class).await?;

    Ok(Json(QuotaStatusResponse {
        identity: identity.to_string(),
        route_class: query.class,
        limit: status.limit,
        remaining: status.remaining,
        reset_after_secs: status.reset_after_secs,
        rate_limited: !status.allowed,
    }))
}

/// Forget one client's window so it starts fresh.
///
/// `DELETE /admin/quota?identity=198.51.100.7&class=auth`
#[instrument(skip(state))]
pub async fn reset_quota(
    State(state): State<AppState>,
    Query(query): Query<QuotaQuery>,
) -> AppResult<StatusCode> {
    let identity = parse_identity(&query.identity)?;

    if state.quota.reset(&identity, query.class).await? {
        info!(client_ip = %identity, route_class = %query.class, "Quota window reset");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!(
            "no open {} window for {identity}",
            query.class
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("10.0.0.0/8").unwrap().prefix_len(), 8);
        assert!(parse_target("10.0.0.0/33").is_err());
        assert!(parse_target("not-an-ip").is_err());
    }

    #[test]
    fn test_parse_identity_drops_port() {
        assert_eq!(
            parse_identity("198.51.100.7:443").unwrap().as_str(),
            "198.51.100.7"
        );
        assert!(parse_identity("unknown").is_err());
    }
}
