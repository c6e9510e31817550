use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quota::QuotaSnapshot;

/// Unified error type for the gapwatch workspace.
///
/// Provider failures, quota rejections, per-item pipeline failures, run
/// deadlines and persistence problems all surface through this enum so that
/// components can fold them into events or aggregated results.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
#[non_exhaustive]
pub enum GapwatchError {
    /// A provider declined or failed a request; the chain moves to the next rank.
    #[error("{provider} unavailable: {msg}")]
    ProviderUnavailable {
        /// Provider name that failed.
        provider: String,
        /// Human-readable error message.
        msg: String,
    },

    /// An individual provider call exceeded the configured timeout.
    #[error("provider timed out: {capability} via {provider}")]
    ProviderTimeout {
        /// Provider name that timed out.
        provider: String,
        /// Capability label (e.g. "quote", "history").
        capability: String,
    },

    /// The provider's ledger has no room for the requested units.
    #[error("quota exhausted for {provider}: {snapshot}")]
    QuotaExhausted {
        /// Provider whose budget is exhausted.
        provider: String,
        /// Ledger state at the time of rejection.
        snapshot: Box<QuotaSnapshot>,
    },

    /// A bus subscriber failed while handling an event.
    #[error("handler {handler} failed: {msg}")]
    HandlerError {
        /// Subscription name.
        handler: String,
        /// Failure description (error text or panic payload).
        msg: String,
    },

    /// A single item failed inside a pipeline step.
    #[error("step {step} failed for {item}: {msg}")]
    StepError {
        /// Pipeline step label.
        step: String,
        /// Item identifier (usually a symbol).
        item: String,
        /// Human-readable error message.
        msg: String,
    },

    /// The workflow run exceeded its wall-clock deadline.
    #[error("run timed out after {elapsed_ms}ms")]
    RunTimeout {
        /// Elapsed milliseconds when the deadline fired.
        elapsed_ms: u64,
    },

    /// The streaming connection dropped or could not be established.
    #[error("stream from {provider} disconnected: {msg}")]
    StreamDisconnect {
        /// Streaming provider name.
        provider: String,
        /// Reason for the disconnect.
        msg: String,
    },

    /// The operation was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,

    /// Invalid input argument.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// A resource or symbol could not be found.
    #[error("not found: {what}")]
    NotFound {
        /// Description of missing resource, e.g. "quote for AAPL".
        what: String,
    },

    /// All eligible providers failed; contains the individual failures.
    #[error("all providers failed: {0:?}")]
    AllProvidersFailed(Vec<GapwatchError>),

    /// Durable state could not be read or written.
    #[error("persistence failure at {path}: {msg}")]
    Persistence {
        /// File path involved.
        path: String,
        /// Underlying I/O or encoding error text.
        msg: String,
    },

    /// Unknown/opaque error.
    #[error("unknown error: {0}")]
    Other(String),
}

impl GapwatchError {
    /// Helper: build a `ProviderUnavailable` error.
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            msg: msg.into(),
        }
    }

    /// Helper: build a `ProviderTimeout` error.
    pub fn provider_timeout(provider: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::ProviderTimeout {
            provider: provider.into(),
            capability: capability.into(),
        }
    }

    /// Helper: build a `QuotaExhausted` error from a ledger snapshot.
    #[must_use]
    pub fn quota_exhausted(snapshot: QuotaSnapshot) -> Self {
        Self::QuotaExhausted {
            provider: snapshot.provider.clone(),
            snapshot: Box::new(snapshot),
        }
    }

    /// Helper: build a `HandlerError`.
    pub fn handler(handler: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::HandlerError {
            handler: handler.into(),
            msg: msg.into(),
        }
    }

    /// Helper: build a `StepError` for one item of a pipeline step.
    pub fn step(step: impl Into<String>, item: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StepError {
            step: step.into(),
            item: item.into(),
            msg: msg.into(),
        }
    }

    /// Helper: build a `StreamDisconnect` error.
    pub fn stream_disconnect(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StreamDisconnect {
            provider: provider.into(),
            msg: msg.into(),
        }
    }

    /// Helper: build a `NotFound` error for a description of the missing resource.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Helper: build a `Persistence` error for a path.
    pub fn persistence(path: impl AsRef<std::path::Path>, msg: impl std::fmt::Display) -> Self {
        Self::Persistence {
            path: path.as_ref().display().to_string(),
            msg: msg.to_string(),
        }
    }

    /// Returns true if the condition is transient and the caller may retry or fall back.
    ///
    /// Run timeouts, configuration problems and persistence failures are not
    /// recoverable. Aggregates are recoverable only if every member is.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ProviderUnavailable { .. }
            | Self::ProviderTimeout { .. }
            | Self::QuotaExhausted { .. }
            | Self::HandlerError { .. }
            | Self::StepError { .. }
            | Self::StreamDisconnect { .. }
            | Self::NotFound { .. } => true,
            Self::AllProvidersFailed(inner) => inner.iter().all(Self::is_recoverable),
            _ => false,
        }
    }

    /// Short machine-friendly label of the variant, used as `error_type` on events.
    #[must_use]
    pub const fn kind_label(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderTimeout { .. } => "provider_timeout",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::HandlerError { .. } => "handler_error",
            Self::StepError { .. } => "step_error",
            Self::RunTimeout { .. } => "run_timeout",
            Self::StreamDisconnect { .. } => "stream_disconnect",
            Self::Cancelled => "cancelled",
            Self::InvalidArg(_) => "invalid_arg",
            Self::Config(_) => "config",
            Self::NotFound { .. } => "not_found",
            Self::AllProvidersFailed(_) => "all_providers_failed",
            Self::Persistence { .. } => "persistence",
            Self::Other(_) => "other",
        }
    }

    /// Flatten nested `AllProvidersFailed` structures into a plain vector.
    #[must_use]
    pub fn flatten(self) -> Vec<Self> {
        match self {
            Self::AllProvidersFailed(list) => list.into_iter().flat_map(Self::flatten).collect(),
            other => vec![other],
        }
    }
}

impl From<serde_json::Error> for GapwatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<csv::Error> for GapwatchError {
    fn from(e: csv::Error) -> Self {
        Self::Persistence {
            path: "usage log".to_string(),
            msg: e.to_string(),
        }
    }
}

impl From<std::io::Error> for GapwatchError {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence {
            path: String::new(),
            msg: e.to_string(),
        }
    }
}
