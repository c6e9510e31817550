//! Request parameters for bar history.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lookback window for history requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Range {
    /// One trading day.
    D1,
    /// Five trading days.
    D5,
    /// One month.
    M1,
    /// Three months.
    M3,
    /// Six months.
    M6,
    /// One year.
    Y1,
}

/// Bar width for history requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Interval {
    /// One minute.
    I1m,
    /// Five minutes.
    I5m,
    /// Fifteen minutes.
    I15m,
    /// One hour.
    H1,
    /// One day.
    D1,
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::D1 => "1d",
            Self::D5 => "5d",
            Self::M1 => "1mo",
            Self::M3 => "3mo",
            Self::M6 => "6mo",
            Self::Y1 => "1y",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I1m => "1m",
            Self::I5m => "5m",
            Self::I15m => "15m",
            Self::H1 => "1h",
            Self::D1 => "1d",
        };
        f.write_str(s)
    }
}

/// History request: a lookback range at a bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Lookback window.
    pub range: Range,
    /// Bar width.
    pub interval: Interval,
}

impl HistoryRequest {
    /// Build a request for `range` at `interval`.
    #[must_use]
    pub const fn new(range: Range, interval: Interval) -> Self {
        Self { range, interval }
    }
}

impl Default for HistoryRequest {
    fn default() -> Self {
        Self::new(Range::M1, Interval::D1)
    }
}
