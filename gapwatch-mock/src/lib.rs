//! Test doubles for gapwatch: a controller-driven provider, ready-made
//! pipeline stages and a manually advanced clock.
//!
//! Nothing here talks to the network, so everything is CI-safe.

use chrono::{DateTime, Utc};
use gapwatch_core::{Bar, Quote, Symbol};

mod clock;
mod dynamic;
mod stages;

pub use clock::ManualClock;
pub use dynamic::{DynamicMockProvider, MockBehavior, MockController, StreamBehavior};
pub use stages::{
    FailingUniverse, GapScanner, GapScorer, HangingScanner, SimplePlanner, StaticUniverse,
    ThresholdRiskGate,
};

/// Quote fixture with a previous close, stamped at the Unix epoch.
#[must_use]
pub fn quote(symbol: &str, price: f64, previous_close: f64) -> Quote {
    let mut q = Quote::new(symbol, price, DateTime::<Utc>::UNIX_EPOCH);
    q.previous_close = Some(previous_close);
    q.volume = Some(1_000_000);
    q
}

/// Flat daily bar fixture.
#[must_use]
pub fn bar(symbol: &str, timestamp: DateTime<Utc>, close: f64) -> Bar {
    Bar {
        symbol: Symbol::new(symbol),
        timestamp,
        open: close,
        high: close,
        low: close,
        close,
        volume: 10_000,
        provider: String::new(),
    }
}
