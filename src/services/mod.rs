//! Gate collaborators: block list, quotas and the security event sink.
//!
//! The gates only talk to these services. Each store sits behind an async
//! trait so a shared backing (e.g. a distributed cache) can replace the
//! in-memory implementations without touching the middleware.

mod block_list;
mod quota;
mod security_metrics;

pub use block_list::{BlockEntry, BlockList, InMemoryBlockList, IpFilteringService};
pub use quota::{
    InMemoryQuotaStore, QuotaDecision, QuotaStore, RateLimitService, WindowKey, WindowState,
};
pub use security_metrics::{BlockReason, BlockTotals, SecurityMetricEvent, SecurityMetricsService};
