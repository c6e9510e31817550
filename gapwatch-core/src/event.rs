//! Event model carried by the bus.
//!
//! An [`Event`] is a tagged union: the payload variant determines its
//! [`EventKind`], which is what subscribers register against.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::Plan;
use crate::types::{ScanKind, Symbol};

/// Usage percent above which a quota warning is `High` unless configured otherwise.
pub const DEFAULT_QUOTA_WARN_PERCENT: f64 = 80.0;

fn quota_warning_priority(usage_percent: f64, warn_percent: f64) -> EventPriority {
    if usage_percent > warn_percent {
        EventPriority::High
    } else {
        EventPriority::Normal
    }
}

/// Urgency of an event. Higher values dispatch first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Background information.
    Low = 0,
    /// Routine traffic.
    #[default]
    Normal = 1,
    /// Needs prompt handling.
    High = 2,
    /// Needs immediate handling.
    Critical = 3,
}

/// Discriminator of an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Request to run a scan.
    ScanRequest,
    /// New or updated data for a symbol.
    DataUpdate,
    /// A plan accepted by the risk gate.
    StageSignal,
    /// Risk gate rejection or other risk condition.
    RiskAlert,
    /// Component lifecycle and progress.
    SystemStatus,
    /// A provider is close to its quota.
    QuotaWarning,
    /// A failure converted into an event.
    Error,
}

impl EventKind {
    /// Snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ScanRequest => "scan_request",
            Self::DataUpdate => "data_update",
            Self::StageSignal => "stage_signal",
            Self::RiskAlert => "risk_alert",
            Self::SystemStatus => "system_status",
            Self::QuotaWarning => "quota_warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a risk alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Attention needed, not urgent.
    Warning,
    /// Urgent.
    Critical,
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Run a scan of `scan_kind`, optionally over an explicit universe.
    ScanRequest {
        /// Which workflow to run.
        scan_kind: ScanKind,
        /// Explicit symbols; `None` resolves the universe.
        universe: Option<Vec<Symbol>>,
    },
    /// Data for one symbol.
    DataUpdate {
        /// Symbol concerned.
        symbol: Symbol,
        /// Label such as "quote" or "score".
        data_type: String,
        /// Payload body.
        data: serde_json::Value,
    },
    /// A plan that passed the risk gate.
    StageSignal {
        /// Accepted plan.
        plan: Plan,
    },
    /// Risk condition.
    RiskAlert {
        /// Label such as "trade_rejected".
        alert_type: String,
        /// Severity; drives default priority.
        severity: Severity,
        /// Human-readable description.
        message: String,
        /// Symbols concerned.
        affected_symbols: Vec<Symbol>,
    },
    /// Component status.
    SystemStatus {
        /// Reporting component.
        component: String,
        /// Status label such as "scan_started".
        status: String,
        /// Human-readable description.
        message: String,
        /// Free-form counters.
        metrics: BTreeMap<String, serde_json::Value>,
    },
    /// A provider crossed its warning threshold.
    QuotaWarning {
        /// Provider concerned.
        provider: String,
        /// Current usage in percent.
        usage_percent: f64,
        /// Units left in the window.
        remaining_calls: u64,
        /// When the window resets.
        reset_at: DateTime<Utc>,
    },
    /// A failure surfaced as an event.
    Error {
        /// Machine-friendly error label.
        error_type: String,
        /// Error text.
        message: String,
        /// Component that failed.
        component: String,
        /// Whether the failure is transient.
        recoverable: bool,
    },
}

impl EventPayload {
    /// Discriminator of this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ScanRequest { .. } => EventKind::ScanRequest,
            Self::DataUpdate { .. } => EventKind::DataUpdate,
            Self::StageSignal { .. } => EventKind::StageSignal,
            Self::RiskAlert { .. } => EventKind::RiskAlert,
            Self::SystemStatus { .. } => EventKind::SystemStatus,
            Self::QuotaWarning { .. } => EventKind::QuotaWarning,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Priority used when the publisher does not override it.
    #[must_use]
    pub fn default_priority(&self) -> EventPriority {
        match self {
            Self::ScanRequest { .. } | Self::StageSignal { .. } => EventPriority::High,
            Self::DataUpdate { .. } | Self::SystemStatus { .. } => EventPriority::Normal,
            Self::RiskAlert { severity, .. } => match severity {
                Severity::Warning => EventPriority::High,
                Severity::Critical => EventPriority::Critical,
            },
            Self::QuotaWarning { usage_percent, .. } => {
                quota_warning_priority(*usage_percent, DEFAULT_QUOTA_WARN_PERCENT)
            }
            Self::Error { recoverable, .. } => {
                if *recoverable {
                    EventPriority::High
                } else {
                    EventPriority::Critical
                }
            }
        }
    }
}

/// An immutable event as published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Dispatch priority.
    pub priority: EventPriority,
    /// Publishing component.
    pub source: String,
    /// Body.
    pub payload: EventPayload,
}

impl Event {
    /// Build an event with the payload's default priority. The bus restamps
    /// `timestamp` from its clock when the event is published.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            priority: payload.default_priority(),
            source: source.into(),
            payload,
        }
    }

    /// Override the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Discriminator of the payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Scan request.
    pub fn scan_request(
        source: impl Into<String>,
        scan_kind: ScanKind,
        universe: Option<Vec<Symbol>>,
    ) -> Self {
        Self::new(source, EventPayload::ScanRequest { scan_kind, universe })
    }

    /// Data update for one symbol.
    pub fn data_update(
        source: impl Into<String>,
        symbol: Symbol,
        data_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(
            source,
            EventPayload::DataUpdate {
                symbol,
                data_type: data_type.into(),
                data,
            },
        )
    }

    /// Accepted plan.
    pub fn stage_signal(source: impl Into<String>, plan: Plan) -> Self {
        Self::new(source, EventPayload::StageSignal { plan })
    }

    /// Risk alert.
    pub fn risk_alert(
        source: impl Into<String>,
        alert_type: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        affected_symbols: Vec<Symbol>,
    ) -> Self {
        Self::new(
            source,
            EventPayload::RiskAlert {
                alert_type: alert_type.into(),
                severity,
                message: message.into(),
                affected_symbols,
            },
        )
    }

    /// System status without metrics.
    pub fn system_status(
        component: impl Into<String>,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::system_status_with_metrics(component, status, message, BTreeMap::new())
    }

    /// System status with counters.
    pub fn system_status_with_metrics(
        component: impl Into<String>,
        status: impl Into<String>,
        message: impl Into<String>,
        metrics: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let component = component.into();
        Self::new(
            component.clone(),
            EventPayload::SystemStatus {
                component,
                status: status.into(),
                message: message.into(),
                metrics,
            },
        )
    }

    /// Quota warning, `High` above the default warning threshold.
    pub fn quota_warning(
        source: impl Into<String>,
        provider: impl Into<String>,
        usage_percent: f64,
        remaining_calls: u64,
        reset_at: DateTime<Utc>,
    ) -> Self {
        Self::quota_warning_over(
            source,
            provider,
            usage_percent,
            remaining_calls,
            reset_at,
            DEFAULT_QUOTA_WARN_PERCENT,
        )
    }

    /// Quota warning, `High` once `usage_percent` exceeds `warn_percent`.
    pub fn quota_warning_over(
        source: impl Into<String>,
        provider: impl Into<String>,
        usage_percent: f64,
        remaining_calls: u64,
        reset_at: DateTime<Utc>,
        warn_percent: f64,
    ) -> Self {
        Self::new(
            source,
            EventPayload::QuotaWarning {
                provider: provider.into(),
                usage_percent,
                remaining_calls,
                reset_at,
            },
        )
        .with_priority(quota_warning_priority(usage_percent, warn_percent))
    }

    /// Error converted into an event.
    pub fn error(
        component: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        let component = component.into();
        Self::new(
            component.clone(),
            EventPayload::Error {
                error_type: error_type.into(),
                message: message.into(),
                component,
                recoverable,
            },
        )
    }

    /// Error event describing a `GapwatchError`.
    pub fn from_error(component: impl Into<String>, err: &crate::GapwatchError) -> Self {
        Self::error(component, err.kind_label(), err.to_string(), err.is_recoverable())
    }
}
