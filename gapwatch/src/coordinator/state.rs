//! Run lifecycle and the record a run leaves behind.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use gapwatch_core::{GapwatchError, Plan, ScanKind};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the coordinator and of each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run in flight.
    Idle,
    /// A run is executing.
    Running,
    /// The pipeline finished.
    Completed,
    /// A newer request or `stop()` cancelled the run.
    Cancelled,
    /// A stage failed at the top level or the deadline fired.
    Failed,
}

impl RunState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Completed | Self::Cancelled | Self::Failed)
                | (Self::Completed | Self::Cancelled | Self::Failed, Self::Idle)
        )
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// Returns `InvalidArg` for a transition outside the table.
    pub fn transition(self, next: Self) -> Result<Self, GapwatchError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(GapwatchError::InvalidArg(format!(
                "illegal run transition {self} -> {next}"
            )))
        }
    }

    /// Whether the state ends a run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    /// Universe resolution.
    Universe,
    /// Quote and bar retrieval.
    Fetch,
    /// Candidate detection.
    Scan,
    /// Scoring.
    Score,
    /// Trade planning.
    Plan,
    /// Risk evaluation.
    Risk,
    /// Signal publication.
    Signal,
}

impl PipelineStep {
    /// Snake-case label, also used as the `step` of per-item errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Universe => "universe",
            Self::Fetch => "fetch",
            Self::Scan => "scan",
            Self::Score => "score",
            Self::Plan => "plan",
            Self::Risk => "risk",
            Self::Signal => "signal",
        }
    }
}

/// Outcome of one run. Read-only once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Monotonic run id.
    pub id: u64,
    /// Workflow kind.
    pub kind: ScanKind,
    /// `Running` while in flight, terminal afterwards.
    pub state: RunState,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time; `None` while running.
    pub finished_at: Option<DateTime<Utc>>,
    /// Items produced by each step that ran.
    pub counts: BTreeMap<PipelineStep, usize>,
    /// Plans approved by the risk gate.
    pub accepted_plans: Vec<Plan>,
    /// Per-item and top-level failures, in the order they occurred.
    pub errors: Vec<GapwatchError>,
}

impl WorkflowRun {
    pub(crate) fn new(id: u64, kind: ScanKind, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            state: RunState::Running,
            started_at,
            finished_at: None,
            counts: BTreeMap::new(),
            accepted_plans: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Items produced by `step`, zero if it never ran.
    #[must_use]
    pub fn count(&self, step: PipelineStep) -> usize {
        self.counts.get(&step).copied().unwrap_or(0)
    }

    /// Per-item failures recorded for `step`.
    #[must_use]
    pub fn step_errors(&self, step: PipelineStep) -> Vec<&GapwatchError> {
        self.errors
            .iter()
            .filter(|e| matches!(e, GapwatchError::StepError { step: s, .. } if s == step.as_str()))
            .collect()
    }

    pub(crate) fn metrics(&self) -> BTreeMap<String, serde_json::Value> {
        let mut m: BTreeMap<String, serde_json::Value> = self
            .counts
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), serde_json::Value::from(*v)))
            .collect();
        m.insert("run_id".into(), self.id.into());
        m.insert("errors".into(), self.errors.len().into());
        m.insert("accepted".into(), self.accepted_plans.len().into());
        if let Some(end) = self.finished_at {
            m.insert(
                "duration_ms".into(),
                end.signed_duration_since(self.started_at).num_milliseconds().into(),
            );
        }
        m
    }
}
