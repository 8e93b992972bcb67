use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::route_class::RouteClass;
use crate::services::{BlockEntry, BlockTotals, SecurityMetricEvent};

/// Request to add a block-list entry.
#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    /// Address or CIDR range to block
    pub target: String,
    /// Free-form reason kept with the entry
    #[serde(default = "default_block_reason")]
    pub reason: String,
    /// Seconds until the entry expires (None = permanent)
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_block_reason() -> String {
    "manual".to_string()
}

/// Query identifying a block-list entry.
#[derive(Debug, Deserialize)]
pub struct BlockTargetQuery {
    pub target: String,
}

/// Block-list listing.
#[derive(Debug, Serialize)]
pub struct BlockListResponse {
    pub count: usize,
    pub entries: Vec<BlockEntry>,
}

/// Query for recent security events.
#[derive(Debug, Deserialize)]
pub struct SecurityEventsQuery {
    /// Maximum number of events to return
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

fn default_event_limit() -> usize {
    50
}

/// Recent security events, newest first.
#[derive(Debug, Serialize)]
pub struct SecurityEventsResponse {
    pub count: usize,
    pub totals: BlockTotals,
    pub events: Vec<SecurityMetricEvent>,
}

/// Query identifying one rate window.
#[derive(Debug, Deserialize)]
pub struct QuotaQuery {
    /// Client identity (an IP address)
    pub identity: String,
    /// Route class, defaults to `api`
    #[serde(default = "default_quota_class")]
    pub class: RouteClass,
}

fn default_quota_class() -> RouteClass {
    RouteClass::Api
}

/// Current state of one rate window.
#[derive(Debug, Serialize)]
pub struct QuotaStatusResponse {
    pub identity: String,
    pub route_class: RouteClass,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after_secs: u64,
    pub rate_limited: bool,
}

/// Which gates are active.
#[derive(Debug, Serialize)]
pub struct GateStatus {
    pub ip_filter: bool,
    pub rate_limit: bool,
    pub fail_mode: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    pub gates: GateStatus,
    /// Whether admitted requests are forwarded upstream
    pub forwarding: bool,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_block_request_defaults() {
        let json = r#"{"target": "203.0.113.0/24"}"#;
        let request: BlockRequest =
            serde_json::from_str(json).expect("Deserialization should succeed");

        assert_eq!(request.target, "203.0.113.0/24");
        assert_eq!(request.reason, "manual");
        assert!(request.ttl_secs.is_none());
    }

    #[test]
    fn test_block_request_with_ttl() {
        let json = r#"{"target": "203.0.113.9", "reason": "credential stuffing", "ttl_secs": 3600}"#;
        let request: BlockRequest =
            serde_json::from_str(json).expect("Deserialization should succeed");

        assert_eq!(request.reason, "credential stuffing");
        assert_eq!(request.ttl_secs, Some(3600));
    }

    #[test]
    fn test_quota_query_default_class() {
        let query: QuotaQuery = serde_json::from_str(r#"{"identity": "10.0.0.1"}"#).unwrap();
        assert_eq!(query.class, RouteClass::Api);

        let query: QuotaQuery =
            serde_json::from_str(r#"{"identity": "10.0.0.1", "class": "payment"}"#).unwrap();
        assert_eq!(query.class, RouteClass::Payment);
    }

    #[test]
    fn test_security_events_query_default_limit() {
        let query: SecurityEventsQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.limit, 50);
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
            uptime_seconds: 12,
            gates: GateStatus {
                ip_filter: true,
                rate_limit: true,
                fail_mode: "open".to_string(),
            },
            forwarding: false,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&response).expect("Serialization should succeed");
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"fail_mode\":\"open\""));
    }
}
