//! gapwatch-core
//!
//! Core types and traits shared across the gapwatch workspace.
//!
//! - `types`: market records (symbols, quotes, bars) and re-exported configuration.
//! - `connector`: the `DataProvider` trait and its capability role traits.
//! - `event`: the tagged event model dispatched by the bus.
//! - `stage`: pluggable pipeline stages consumed by the coordinator.
//!
//! Async runtime (Tokio)
//! ---------------------
//! `stream::StreamHandle` wraps `tokio::task::JoinHandle<()>` and
//! `connector::StreamProvider` returns a `tokio::sync::mpsc::Receiver<Quote>`,
//! so streaming code must run under a Tokio 1.x runtime.
#![warn(missing_docs)]

/// Wall-clock abstraction.
pub mod clock;
/// Provider capability traits and the primary `DataProvider` interface.
pub mod connector;
/// Events dispatched by the bus.
pub mod event;
/// Pipeline stage traits and their records.
pub mod stage;
/// Owned handle for provider stream tasks.
pub mod stream;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use connector::{DataProvider, HistoryProvider, QuoteProvider, StreamProvider};
pub use event::{DEFAULT_QUOTA_WARN_PERCENT, Event, EventKind, EventPayload, EventPriority, Severity};
pub use gapwatch_types::GapwatchError;
pub use stage::{
    Candidate, Decision, MarketSnapshot, Plan, Planner, RiskGate, ScoredCandidate, Scanner,
    Scorer, StageOutput, Stages, UniverseResolver,
};
pub use stream::StreamHandle;
pub use types::*;
