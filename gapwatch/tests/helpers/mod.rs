// Shared fixtures; each test binary uses a different subset.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use gapwatch::{EventBus, handler_fn};
use gapwatch_core::{CoordinatorConfig, Event, EventKind, Stages, Symbol};
use gapwatch_mock::{GapScanner, GapScorer, SimplePlanner, StaticUniverse, ThresholdRiskGate};

pub const AAPL: &str = "AAPL";
pub const MSFT: &str = "MSFT";
pub const TSLA: &str = "TSLA";
pub const NVDA: &str = "NVDA";

pub fn sym(s: &str) -> Symbol {
    Symbol::new(s)
}

pub fn syms(list: &[&str]) -> Vec<Symbol> {
    list.iter().copied().map(Symbol::new).collect()
}

/// Construct a UTC `DateTime` from components.
pub fn dt(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, hh, mm, ss).unwrap()
}

/// A running bus with room for plenty of events and a short drain.
pub async fn running_bus() -> EventBus {
    let bus = EventBus::with_limits(4096, Duration::from_secs(2));
    bus.start().await;
    bus
}

/// Collects every event of `kind` published on `bus`.
pub fn record(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<Arc<Event>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(
        kind,
        format!("recorder:{kind}"),
        handler_fn(move |ev: Arc<Event>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(ev);
                Ok(())
            }
        }),
    );
    seen
}

/// Poll `cond` until it holds, failing the test after `within`.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + within;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {within:?}"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Gap pipeline over a fixed universe: 3% minimum gap, approval at score 4.
pub fn gap_stages(universe: &[&str]) -> Stages {
    Stages::new(
        Arc::new(StaticUniverse::of(universe)),
        Arc::new(GapScanner::new(3.0)),
        Arc::new(GapScorer::default()),
        Arc::new(SimplePlanner),
        Arc::new(ThresholdRiskGate::new(4.0)),
    )
}

pub fn coordinator_cfg() -> CoordinatorConfig {
    CoordinatorConfig {
        run_deadline_ms: 2_000,
        ..CoordinatorConfig::default()
    }
}
