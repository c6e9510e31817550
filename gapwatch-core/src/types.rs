//! Market data records exchanged between providers, the chain and pipeline stages.

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use gapwatch_types::{
    BackoffConfig, BusConfig, CacheConfig, ChainConfig, ConnectionState, CoordinatorConfig,
    DataPriority, GapwatchConfig, HistoryRequest, Interval, ProviderKey, QuotaGuardConfig,
    QuotaLedgerEntry, QuotaLimit, QuotaPeriod, QuotaSnapshot, Range, ScanKind, SchedulerConfig,
    TriggerConfig, UsageLogRecord, parse_local_time,
};

/// Ticker symbol, upper-cased on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Build a symbol, trimming whitespace and upper-casing.
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().trim().to_ascii_uppercase())
    }

    /// Borrow the symbol text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Point-in-time quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Time the provider observed the price.
    pub timestamp: DateTime<Utc>,
    /// Last traded price.
    pub price: f64,
    /// Previous session close, when known.
    pub previous_close: Option<f64>,
    /// Best bid.
    pub bid: Option<f64>,
    /// Best ask.
    pub ask: Option<f64>,
    /// Session volume.
    pub volume: Option<u64>,
    /// Provider that served the quote.
    pub provider: String,
    /// True when the serving source only guarantees delayed data.
    pub delayed: bool,
}

impl Quote {
    /// Minimal quote; optional fields empty, realtime freshness.
    pub fn new(symbol: impl Into<Symbol>, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            price,
            previous_close: None,
            bid: None,
            ask: None,
            volume: None,
            provider: String::new(),
            delayed: false,
        }
    }

    /// Percentage move from the previous close, if that is known and non-zero.
    #[must_use]
    pub fn gap_percent(&self) -> Option<f64> {
        match self.previous_close {
            Some(pc) if pc != 0.0 => Some((self.price - pc) / pc * 100.0),
            _ => None,
        }
    }
}

/// OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Bar open time.
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Traded volume.
    pub volume: u64,
    /// Provider that served the bar.
    pub provider: String,
}
