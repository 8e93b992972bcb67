//! HTTP middleware: the request gates and admin authentication.
//!
//! - **IP Filter**: Rejects blocked client addresses and ranges (403)
//! - **Rate Limiting**: Fixed-window quotas per client and route class (429)
//! - **API Key Authentication**: Constant-time key check for `/admin`
//! - **Client Identity**: One validated resolution shared by all of the above
//!
//! # Architecture
//!
//! ```text
//! Request → IP Filter → Rate Limiter → Handler → Response
//!              ↓             ↓
//!          403 Forbidden  429 Too Many Requests
//! ```
//!
//! Both gates consult their store under a timeout. When the store fails the
//! configured `GATE_FAIL_MODE` decides between admitting the request (`open`)
//! and answering 503 (`closed`).

pub mod auth;
mod gate;
pub mod ip;
pub mod ip_filter;
pub mod rate_limit;

pub use auth::{ApiKeyAuth, AuthFailureTracker};
pub use ip::{
    CidrRange, ClientIdentity, TrustedProxyConfig, UNKNOWN_IP, request_identity,
    resolve_client_identity,
};
pub use ip_filter::IpFilterLayer;
pub use rate_limit::{RateLimitError, RateLimitLayer};
