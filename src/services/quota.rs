//! Per-client, per-route-class request quotas.
//!
//! # Windowing
//!
//! Quotas use fixed windows: the first request for a `(client, route class)`
//! key opens a window of `RATE_LIMIT_WINDOW_SECS`; up to `limit` requests are
//! admitted until it ends, then the next request opens a fresh window.
//!
//! Rejected requests do not consume quota. Once a window is exhausted the
//! counter stays at the limit, so a client hammering a 429 cannot push its
//! own reset further out.
//!
//! # Atomicity
//!
//! [`InMemoryQuotaStore`] keeps windows in a `DashMap`. The check, the
//! increment and the window roll-over for one key all happen under that key's
//! shard lock, so concurrent requests can neither lose an update nor both see
//! a freshly reset window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RouteLimits;
use crate::error::StoreError;
use crate::middleware::ip::ClientIdentity;
use crate::route_class::RouteClass;

/// Key of one rate window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub identity: ClientIdentity,
    pub class: RouteClass,
}

impl WindowKey {
    pub fn new(identity: ClientIdentity, class: RouteClass) -> Self {
        Self { identity, class }
    }
}

/// Point-in-time view of a rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Requests counted in the current window
    pub count: u32,
    /// Whether the request that produced this state was counted
    pub admitted: bool,
    /// Time until the window resets
    pub reset_after: Duration,
}

/// Backing store for rate windows.
///
/// Implementations must make `try_acquire` atomic per key. A distributed
/// backing (e.g. a shared cache) plugs in here; callers bound every call with
/// a timeout.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Count one request against `key` unless `limit` is already reached.
    async fn try_acquire(
        &self,
        key: &WindowKey,
        limit: u32,
        window: Duration,
    ) -> Result<WindowState, StoreError>;

    /// Current window for `key` without counting anything.
    ///
    /// Returns `None` when no window is open (never used or expired).
    async fn peek(
        &self,
        key: &WindowKey,
        window: Duration,
    ) -> Result<Option<WindowState>, StoreError>;

    /// Drop the window for `key`. Returns whether one existed.
    async fn reset(&self, key: &WindowKey) -> Result<bool, StoreError>;

    /// Remove windows that ended. Returns how many were removed.
    async fn purge_expired(&self, window: Duration) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    fn is_expired(&self, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    fn reset_after(&self, window: Duration, now: Instant) -> Duration {
        window.saturating_sub(now.saturating_duration_since(self.window_start))
    }
}

/// In-process fixed-window store.
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    windows: DashMap<WindowKey, RateWindow>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open windows (including expired ones not yet purged).
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn try_acquire_at(
        &self,
        key: &WindowKey,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> WindowState {
        let mut entry = self.windows.entry(key.clone()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });

        if entry.is_expired(window, now) {
            *entry = RateWindow {
                count: 0,
                window_start: now,
            };
        }

        let admitted = entry.count < limit;
        if admitted {
            entry.count += 1;
        }

        WindowState {
            count: entry.count,
            admitted,
            reset_after: entry.reset_after(window, now),
        }
    }

    fn peek_at(&self, key: &WindowKey, window: Duration, now: Instant) -> Option<WindowState> {
        let entry = self.windows.get(key)?;
        if entry.is_expired(window, now) {
            return None;
        }
        Some(WindowState {
            count: entry.count,
            admitted: true,
            reset_after: entry.reset_after(window, now),
        })
    }

    fn purge_expired_at(&self, window: Duration, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_expired(window, now));
        before.saturating_sub(self.windows.len())
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn try_acquire(
        &self,
        key: &WindowKey,
        limit: u32,
        window: Duration,
    ) -> Result<WindowState, StoreError> {
        Ok(self.try_acquire_at(key, limit, window, Instant::now()))
    }

    async fn peek(
        &self,
        key: &WindowKey,
        window: Duration,
    ) -> Result<Option<WindowState>, StoreError> {
        Ok(self.peek_at(key, window, Instant::now()))
    }

    async fn reset(&self, key: &WindowKey) -> Result<bool, StoreError> {
        Ok(self.windows.remove(key).is_some())
    }

    async fn purge_expired(&self, window: Duration) -> Result<usize, StoreError> {
        Ok(self.purge_expired_at(window, Instant::now()))
    }
}

/// Outcome of a quota check, as reported in the `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after_secs: u64,
}

/// Rounds up so a client waiting `reset_after_secs` never arrives early.
fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Quota policy: route-class limits applied over a [`QuotaStore`].
#[derive(Clone)]
pub struct RateLimitService {
    store: Arc<dyn QuotaStore>,
    limits: RouteLimits,
    window: Duration,
    timeout: Duration,
}

impl RateLimitService {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        limits: RouteLimits,
        window: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            limits,
            window,
            timeout,
        }
    }

    /// Policy backed by a fresh [`InMemoryQuotaStore`].
    pub fn in_memory(limits: RouteLimits, window: Duration, timeout: Duration) -> Self {
        Self::new(Arc::new(InMemoryQuotaStore::new()), limits, window, timeout)
    }

    /// Configured limit for a route class.
    pub fn limit_for(&self, class: RouteClass) -> u32 {
        self.limits.for_class(class)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let millis = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(millis))?
    }

    fn decision(&self, class: RouteClass, state: Option<WindowState>) -> QuotaDecision {
        let limit = self.limit_for(class);
        match state {
            Some(state) => QuotaDecision {
                allowed: state.admitted,
                limit,
                remaining: limit.saturating_sub(state.count),
                reset_after_secs: ceil_secs(state.reset_after),
            },
            None => QuotaDecision {
                allowed: true,
                limit,
                remaining: limit,
                reset_after_secs: ceil_secs(self.window),
            },
        }
    }

    /// Count one request and decide whether it is admitted.
    ///
    /// This is the single atomic call the rate limit gate makes per request.
    pub async fn check(
        &self,
        identity: &ClientIdentity,
        class: RouteClass,
    ) -> Result<QuotaDecision, StoreError> {
        let key = WindowKey::new(identity.clone(), class);
        let state = self
            .bounded(self.store.try_acquire(&key, self.limit_for(class), self.window))
            .await?;
        Ok(self.decision(class, Some(state)))
    }

    /// Current quota status without counting a request.
    pub async fn status(
        &self,
        identity: &ClientIdentity,
        class: RouteClass,
    ) -> Result<QuotaDecision, StoreError> {
        let key = WindowKey::new(identity.clone(), class);
        let state = self.bounded(self.store.peek(&key, self.window)).await?;
        let mut decision = self.decision(class, state);
        decision.allowed = decision.remaining > 0;
        Ok(decision)
    }

    /// Whether the client has exhausted its quota for `class`.
    pub async fn is_rate_limited(
        &self,
        identity: &ClientIdentity,
        class: RouteClass,
    ) -> Result<bool, StoreError> {
        Ok(!self.status(identity, class).await?.allowed)
    }

    pub async fn is_auth_rate_limited(&self, identity: &ClientIdentity) -> Result<bool, StoreError> {
        self.is_rate_limited(identity, RouteClass::Auth).await
    }

    pub async fn is_payment_rate_limited(
        &self,
        identity: &ClientIdentity,
    ) -> Result<bool, StoreError> {
        self.is_rate_limited(identity, RouteClass::Payment).await
    }

    pub async fn is_api_rate_limited(&self, identity: &ClientIdentity) -> Result<bool, StoreError> {
        self.is_rate_limited(identity, RouteClass::Api).await
    }

    /// Requests left in the client's current window for `class`.
    pub async fn remaining_requests(
        &self,
        identity: &ClientIdentity,
        class: RouteClass,
    ) -> Result<u32, StoreError> {
        Ok(self.status(identity, class).await?.remaining)
    }

    /// Seconds until the client's window for `class` resets.
    pub async fn reset_time(
        &self,
        identity: &ClientIdentity,
        class: RouteClass,
    ) -> Result<u64, StoreError> {
        Ok(self.status(identity, class).await?.reset_after_secs)
    }

    /// Forget the client's window for `class`.
    pub async fn reset(
        &self,
        identity: &ClientIdentity,
        class: RouteClass,
    ) -> Result<bool, StoreError> {
        let key = WindowKey::new(identity.clone(), class);
        self.bounded(self.store.reset(&key)).await
    }

    /// Remove ended windows from the store.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.store.purge_expired(self.window).await
    }
}
