//! Quota ledger primitives and usage audit records.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Rolling window over which a provider's call allowance resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    /// 60 seconds.
    Minute,
    /// 60 minutes.
    Hour,
    /// 24 hours.
    Day,
    /// 30 days.
    Month,
}

impl QuotaPeriod {
    /// Length of the window as elapsed time.
    #[must_use]
    pub fn duration(self) -> TimeDelta {
        match self {
            Self::Minute => TimeDelta::minutes(1),
            Self::Hour => TimeDelta::hours(1),
            Self::Day => TimeDelta::days(1),
            Self::Month => TimeDelta::days(30),
        }
    }

    /// Lowercase label used in files and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }
}

impl fmt::Display for QuotaPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-provider use counter over a reset period.
///
/// `used` grows only through consumption and drops back to zero only through
/// a reset (lazy on elapsed time, or explicit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLedgerEntry {
    /// Provider identifier.
    pub provider: String,
    /// Units allowed per period.
    pub limit: u64,
    /// Reset period.
    pub period: QuotaPeriod,
    /// Units consumed since `last_reset`.
    pub used: u64,
    /// Start of the current window.
    pub last_reset: DateTime<Utc>,
    /// Last successful consumption, if any.
    pub last_call: Option<DateTime<Utc>>,
}

impl QuotaLedgerEntry {
    /// Fresh entry with an empty window starting at `now`.
    pub fn new(provider: impl Into<String>, limit: u64, period: QuotaPeriod, now: DateTime<Utc>) -> Self {
        Self {
            provider: provider.into(),
            limit,
            period,
            used: 0,
            last_reset: now,
            last_call: None,
        }
    }

    /// Units still available in the current window.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    /// Share of the limit already consumed, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_percent(&self) -> f64 {
        if self.limit == 0 {
            return 100.0;
        }
        (self.used as f64 / self.limit as f64) * 100.0
    }

    /// Whether the window has elapsed at `now`.
    #[must_use]
    pub fn should_reset(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_reset) >= self.period.duration()
    }

    /// Reset the window if it has elapsed; returns whether a reset happened.
    pub fn reset_if_elapsed(&mut self, now: DateTime<Utc>) -> bool {
        if self.should_reset(now) {
            self.reset(now);
            true
        } else {
            false
        }
    }

    /// Unconditionally start a new window at `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.used = 0;
        self.last_reset = now;
    }

    /// Point-in-time view of this entry.
    #[must_use]
    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            provider: self.provider.clone(),
            used: self.used,
            limit: self.limit,
            remaining: self.remaining(),
            period: self.period,
            usage_percent: self.usage_percent(),
            last_reset: self.last_reset,
            last_call: self.last_call,
            resets_at: self.last_reset + self.period.duration(),
        }
    }
}

/// Read-only view of a ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Provider identifier.
    pub provider: String,
    /// Units consumed in the current window.
    pub used: u64,
    /// Units allowed per window.
    pub limit: u64,
    /// Units still available.
    pub remaining: u64,
    /// Reset period.
    pub period: QuotaPeriod,
    /// `used / limit` in percent.
    pub usage_percent: f64,
    /// Start of the current window.
    pub last_reset: DateTime<Utc>,
    /// Last successful consumption.
    pub last_call: Option<DateTime<Utc>>,
    /// When the current window elapses.
    pub resets_at: DateTime<Utc>,
}

impl fmt::Display for QuotaSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} per {} (remaining {}, resets at {})",
            self.used,
            self.limit,
            self.period,
            self.remaining,
            self.resets_at.to_rfc3339()
        )
    }
}

/// One attempted consumption as written to the usage audit log.
///
/// Field order matches the log's column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLogRecord {
    /// When the attempt happened.
    pub timestamp: DateTime<Utc>,
    /// Provider identifier.
    pub provider: String,
    /// Endpoint label supplied by the caller.
    pub endpoint: String,
    /// Units requested.
    pub count: u64,
    /// Ledger usage before the attempt.
    pub usage_before: u64,
    /// Ledger usage after the attempt (unchanged on failure).
    pub usage_after: u64,
    /// Limit at the time of the attempt.
    pub limit: u64,
    /// `usage_after / limit` in percent.
    pub percentage: f64,
    /// Reset period.
    pub period: QuotaPeriod,
    /// Whether the units were granted.
    pub success: bool,
    /// Failure reason for rejected attempts.
    pub error_message: Option<String>,
}
