//! Shared infrastructure in front of rate-limited providers: the quota ledger,
//! its CSV audit log, and the TTL result cache.
#![warn(missing_docs)]

/// TTL cache for provider results.
pub mod cache;
/// Per-provider quota ledger.
pub mod quota;
mod snapshot;
/// Append-only usage audit log.
pub mod usage_log;

pub use cache::{CacheEntry, CacheStats, TtlCache, cache_key};
pub use quota::{FallbackCallback, QuotaGuard, QuotaGuardBuilder};
pub use usage_log::{ProviderUsage, USAGE_LOG_COLUMNS, UsageLog, UsageSummary};
