//! # Wellness Gateway
//!
//! Request gates in front of the wellness platform backend:
//!
//! - **IP Filter**: Blocked addresses and CIDR ranges get `403 Forbidden`
//! - **Rate Limiting**: Fixed-window quotas per client and route class
//! - **Admin API**: Manage the block list, inspect security events and quotas
//! - **Observability**: Structured logging, request IDs, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → Trace → IP Filter → Rate Limit)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, admin, upstream forwarding)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Services (IpFilteringService, RateLimitService,            │
//! │            SecurityMetricsService)                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Stores (BlockList, QuotaStore - in-memory by default)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wellness_gateway::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state.clone())?;
//!
//!     // Serve `app` with connect info so gates see the peer address...
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Gate Configuration
//!
//! ```bash
//! RATE_LIMIT_AUTH=5 RATE_LIMIT_WINDOW_SECS=60 BLOCKED_IPS=203.0.113.0/24 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod route_class;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::{Config, FailMode, RouteLimits};
pub use error::{AppError, AppResult, StoreError};
pub use route_class::RouteClass;
pub use routes::build_router;
pub use state::AppState;
