//! Shared application state for Axum handlers and the gates.
//!
//! This module provides thread-safe, clonable state that is shared across
//! all request handlers. It includes:
//!
//! - **Gate services**: Block list, quotas and the security event sink
//! - **Admin auth failures**: Lockout state shared with the `/admin` layer
//! - **Upstream client**: `reqwest` client for forwarding admitted requests
//! - **Configuration**: Runtime configuration access
//!
//! # Structured Concurrency
//!
//! The background purge of expired rate windows, blocks and admin lockouts
//! is managed using
//! `tokio_util::task::TaskTracker` and `CancellationToken`. Call `shutdown()`
//! to stop it before application exit.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::middleware::AuthFailureTracker;
use crate::middleware::ip::TrustedProxyConfig;
use crate::services::{
    BlockList, InMemoryBlockList, InMemoryQuotaStore, IpFilteringService, QuotaStore,
    RateLimitService, SecurityMetricsService,
};

/// Shared application state.
///
/// Cloned for each request handler; all internal data is behind `Arc`.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;  // Stop the purge task
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Block-list policy used by the IP filter gate and admin API
    pub ip_filter: IpFilteringService,
    /// Quota policy used by the rate limit gate and admin API
    pub quota: RateLimitService,
    /// Record of rejected requests
    pub security: SecurityMetricsService,
    /// Proxies whose forwarded headers are honoured
    pub trusted_proxies: TrustedProxyConfig,
    /// Failed admin authentication attempts per client
    pub auth_failures: Arc<AuthFailureTracker>,
    /// Client for the platform backend (None = forwarding disabled)
    pub upstream: Option<reqwest::Client>,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create state backed by in-memory stores.
    ///
    /// Spawns the background purge task, so this must run inside a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the upstream client cannot be built.
    pub fn new(config: Config) -> AppResult<Self> {
        Self::with_stores(
            config,
            Arc::new(InMemoryBlockList::new()),
            Arc::new(InMemoryQuotaStore::new()),
        )
    }

    /// Create state over the given block-list and quota stores.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the upstream client cannot be built.
    pub fn with_stores(
        config: Config,
        block_list: Arc<dyn BlockList>,
        quota_store: Arc<dyn QuotaStore>,
    ) -> AppResult<Self> {
        let ip_filter = IpFilteringService::new(block_list, config.gate_store_timeout);
        let quota = RateLimitService::new(
            quota_store,
            config.route_limits,
            config.rate_limit_window,
            config.gate_store_timeout,
        );
        let security = SecurityMetricsService::new(config.security_event_capacity);
        let trusted_proxies = TrustedProxyConfig::new(&config.trusted_proxies);

        let upstream = if config.forwarding_enabled() {
            let client = reqwest::Client::builder()
                .timeout(config.upstream_timeout)
                .build()
                .map_err(|e| AppError::ConfigError(format!("Failed to build upstream client: {e}")))?;
            Some(client)
        } else {
            None
        };

        let state = Self {
            config: Arc::new(config),
            ip_filter,
            quota,
            security,
            trusted_proxies,
            auth_failures: Arc::new(AuthFailureTracker::new()),
            upstream,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_cleanup_task();

        Ok(state)
    }

    /// Spawn the periodic purge of expired rate windows, blocks and lockouts.
    fn spawn_cleanup_task(&self) {
        let ip_filter = self.ip_filter.clone();
        let quota = self.quota.clone();
        let auth_failures = self.auth_failures.clone();
        let period = self.config.cleanup_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Cleanup task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        purge_expired(&ip_filter, &quota, &auth_failures).await;
                    }
                }
            }

            debug!("Cleanup task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Signals the tasks to stop, closes the tracker and waits for them.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// One purge pass over the gate stores and the admin lockouts.
async fn purge_expired(
    ip_filter: &IpFilteringService,
    quota: &RateLimitService,
    auth_failures: &AuthFailureTracker,
) {
    match quota.purge_expired().await {
        Ok(removed) => {
            metrics::set_purged_entries("quota", removed);
            trace!(removed, "Purged expired rate windows");
        }
        Err(e) => warn!(error = %e, "Failed to purge rate windows"),
    }

    match ip_filter.purge_expired().await {
        Ok(removed) => {
            metrics::set_purged_entries("block_list", removed);
            if removed > 0 {
                info!(removed, "Purged expired block-list entries");
            }
        }
        Err(e) => warn!(error = %e, "Failed to purge block list"),
    }

    let removed = auth_failures.purge_stale();
    metrics::set_purged_entries("auth_lockouts", removed);
    trace!(
        removed,
        tracked = auth_failures.tracked_clients(),
        "Purged admin auth failure state"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::middleware::ip::ClientIdentity;
    use crate::route_class::RouteClass;

    #[tokio::test]
    async fn test_new_state_without_upstream() {
        let state = AppState::new(Config::default()).unwrap();
        assert!(state.upstream.is_none());
        assert!(!state.trusted_proxies.is_enabled());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_state_with_upstream() {
        let config = Config {
            upstream_url: Some("http://backend:8080".to_string()),
            ..Config::default()
        };
        let state = AppState::new(config).unwrap();
        assert!(state.upstream.is_some());
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_purges_expired_windows() {
        let config = Config {
            rate_limit_window: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(30),
            ..Config::default()
        };
        let store = Arc::new(InMemoryQuotaStore::new());
        let state =
            AppState::with_stores(config, Arc::new(InMemoryBlockList::new()), store.clone())
                .unwrap();
        state
            .quota
            .check(&ClientIdentity::new("10.0.0.1"), RouteClass::Api)
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        // Let the purge pass run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(store.is_empty());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_tasks() {
        let state = AppState::new(Config::default()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), state.shutdown())
            .await
            .expect("shutdown should finish promptly");
    }
}
