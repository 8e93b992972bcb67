//! Append-only record of requests rejected by the gates.
//!
//! Every rejection bumps a Prometheus counter and is kept in a bounded
//! in-memory ring so operators can inspect recent offenders through the admin
//! API. The oldest events are dropped once the ring is full.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::metrics;
use crate::middleware::ip::ClientIdentity;

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    IpFiltered,
    RateLimited,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::IpFiltered => "IP_FILTERED",
            BlockReason::RateLimited => "RATE_LIMITED",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rejected request.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityMetricEvent {
    pub id: Uuid,
    pub reason: BlockReason,
    pub client_identity: ClientIdentity,
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

/// Totals per rejection reason since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockTotals {
    pub ip_filtered: u64,
    pub rate_limited: u64,
}

#[derive(Debug)]
struct Inner {
    events: Mutex<VecDeque<SecurityMetricEvent>>,
    capacity: usize,
    ip_filtered: AtomicU64,
    rate_limited: AtomicU64,
}

/// Sink for rejected-request events.
#[derive(Debug, Clone)]
pub struct SecurityMetricsService {
    inner: Arc<Inner>,
}

impl SecurityMetricsService {
    /// Create a sink keeping at most `capacity` recent events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity,
                ip_filtered: AtomicU64::new(0),
                rate_limited: AtomicU64::new(0),
            }),
        }
    }

    /// Record a rejected request.
    pub fn record_blocked_request(&self, reason: BlockReason, identity: &ClientIdentity, path: &str) {
        metrics::record_blocked_request(reason.as_str());

        let counter = match reason {
            BlockReason::IpFiltered => &self.inner.ip_filtered,
            BlockReason::RateLimited => &self.inner.rate_limited,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if self.inner.capacity == 0 {
            return;
        }

        let event = SecurityMetricEvent {
            id: Uuid::new_v4(),
            reason,
            client_identity: identity.clone(),
            path: path.to_string(),
            timestamp: Utc::now(),
        };

        // A panic while holding the lock cannot leave the ring inconsistent
        let mut events = self
            .inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.inner.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityMetricEvent> {
        let events = self
            .inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        events.iter().rev().take(limit).cloned().collect()
    }

    pub fn totals(&self) -> BlockTotals {
        BlockTotals {
            ip_filtered: self.inner.ip_filtered.load(Ordering::Relaxed),
            rate_limited: self.inner.rate_limited.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_records_event_and_total() {
        let sink = SecurityMetricsService::new(10);
        let identity = ClientIdentity::new("203.0.113.9");

        sink.record_blocked_request(BlockReason::IpFiltered, &identity, "/api/forum/posts");

        let events = sink.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, BlockReason::IpFiltered);
        assert_eq!(events[0].client_identity, identity);
        assert_eq!(events[0].path, "/api/forum/posts");
        assert_eq!(
            sink.totals(),
            BlockTotals {
                ip_filtered: 1,
                rate_limited: 0
            }
        );
    }

    #[test]
    fn test_ring_drops_oldest_and_returns_newest_first() {
        let sink = SecurityMetricsService::new(2);
        for i in 1..=3 {
            sink.record_blocked_request(
                BlockReason::RateLimited,
                &ClientIdentity::new(format!("10.0.0.{i}")),
                "/api/auth/login",
            );
        }

        let ips: Vec<_> = sink
            .recent_events(10)
            .into_iter()
            .map(|e| e.client_identity.to_string())
            .collect();
        assert_eq!(ips, vec!["10.0.0.3", "10.0.0.2"]);
        assert_eq!(sink.totals().rate_limited, 3);
    }

    #[test]
    fn test_zero_capacity_still_counts() {
        let sink = SecurityMetricsService::new(0);
        sink.record_blocked_request(BlockReason::IpFiltered, &ClientIdentity::unknown(), "/");

        assert!(sink.recent_events(10).is_empty());
        assert_eq!(sink.totals().ip_filtered, 1);
    }

    #[test]
    fn test_reason_serializes_as_tag() {
        assert_eq!(
            serde_json::to_string(&BlockReason::IpFiltered).unwrap(),
            r#""IP_FILTERED""#
        );
        assert_eq!(BlockReason::RateLimited.to_string(), "RATE_LIMITED");
    }
}
