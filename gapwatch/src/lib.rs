//! Gapwatch orchestrates the infrastructure of a market-scanning agent.
//!
//! Overview
//! - [`bus::EventBus`]: bounded priority publish/subscribe with isolated handlers.
//! - [`chain::ProviderFallbackChain`]: ranked providers behind a quota ledger and
//!   a TTL cache, with a supervised streaming leg that reconnects with backoff.
//! - [`coordinator::Coordinator`]: runs the scan pipeline, one run at a time,
//!   under a deadline, folding per-item failures into the run record.
//! - [`scheduler::Scheduler`]: fires scans at local times across DST changes
//!   and keeps the stream supervised.
//! - [`Runtime`]: builds all of the above from a [`GapwatchConfig`].
//!
//! Errors never cross component boundaries as panics or transport errors:
//! they are retried, turned into events, or recorded on a [`WorkflowRun`].
//!
//! ```rust,ignore
//! use gapwatch::{GapwatchConfig, Runtime};
//!
//! let runtime = Runtime::builder(GapwatchConfig::load("gapwatch.json")?)
//!     .with_provider(finnhub)
//!     .with_provider(yahoo)
//!     .stages(stages)
//!     .build()?;
//! runtime.start().await;
//! runtime.scheduler().trigger_manual(ScanKind::Manual);
//! ```
#![warn(missing_docs)]

/// Priority event bus.
pub mod bus;
/// Provider fallback chain and streaming supervisor.
pub mod chain;
/// Workflow coordinator.
pub mod coordinator;
mod runtime;
/// Daily scan triggers.
pub mod scheduler;

pub use bus::{BusMetrics, EventBus, EventFilter, EventHandler, SubscriptionId, filter_fn, handler_fn};
pub use chain::streaming::QuoteCallback;
pub use chain::{ChainBuilder, ProviderFallbackChain, ProviderHealth};
pub use coordinator::{Coordinator, PipelineStep, RunState, WorkflowRun};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::{ScheduledTask, Scheduler, SchedulerStatus};

pub use gapwatch_core::{
    Bar, ConnectionState, DataPriority, Event, EventKind, EventPayload, EventPriority,
    GapwatchConfig, GapwatchError, Quote, ScanKind, Stages, Symbol,
};
pub use gapwatch_middleware::{QuotaGuard, TtlCache};
