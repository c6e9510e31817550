//! Pluggable analysis stages driven by the coordinator.
//!
//! Stages are business logic supplied by the embedding application. Each
//! batch stage reports per-item failures inside [`StageOutput::errors`]; a
//! returned `Err` means the whole stage failed and ends the run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::GapwatchError;
use crate::types::{Bar, Quote, Symbol};

/// Items produced by a stage plus the items that failed.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput<T> {
    /// Successful outputs.
    pub items: Vec<T>,
    /// Per-item failures, usually `GapwatchError::StepError`.
    pub errors: Vec<GapwatchError>,
}

impl<T> StageOutput<T> {
    /// Output with no failures.
    #[must_use]
    pub const fn ok(items: Vec<T>) -> Self {
        Self {
            items,
            errors: Vec::new(),
        }
    }

    /// Output with items and per-item failures.
    #[must_use]
    pub const fn new(items: Vec<T>, errors: Vec<GapwatchError>) -> Self {
        Self { items, errors }
    }
}

impl<T> Default for StageOutput<T> {
    fn default() -> Self {
        Self::ok(Vec::new())
    }
}

/// Data fetched for the universe before scanning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketSnapshot {
    /// Symbols the run was asked to cover.
    pub symbols: Vec<Symbol>,
    /// Quotes that could be resolved.
    pub quotes: HashMap<Symbol, Quote>,
    /// Bars, when history was requested.
    pub bars: HashMap<Symbol, Vec<Bar>>,
}

/// A symbol flagged by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Symbol.
    pub symbol: Symbol,
    /// Current price.
    pub price: f64,
    /// Previous session close.
    pub previous_close: f64,
    /// Move from the previous close in percent.
    pub gap_percent: f64,
    /// Session volume, when known.
    pub volume: Option<u64>,
}

/// A candidate with its composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    /// Underlying candidate.
    pub candidate: Candidate,
    /// Composite score; higher is better.
    pub score: f64,
    /// Factor breakdown.
    pub factors: BTreeMap<String, f64>,
}

/// A proposed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Symbol.
    pub symbol: Symbol,
    /// Entry price.
    pub entry: f64,
    /// Stop-loss price.
    pub stop: f64,
    /// Profit target.
    pub target: f64,
    /// Position size in shares.
    pub quantity: u64,
    /// Score of the candidate this plan came from.
    pub score: f64,
}

/// Risk gate verdict on one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the plan may proceed.
    pub approved: bool,
    /// Explanation.
    pub reason: String,
}

impl Decision {
    /// Approved with a reason.
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    /// Rejected with a reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

/// Produces the symbols a run covers.
#[async_trait]
pub trait UniverseResolver: Send + Sync {
    /// Resolve the universe. An error is a top-level failure.
    async fn resolve_universe(&self) -> Result<Vec<Symbol>, GapwatchError>;
}

/// Detects candidates in fetched market data.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scan the snapshot.
    async fn scan(&self, data: &MarketSnapshot) -> Result<StageOutput<Candidate>, GapwatchError>;
}

/// Scores candidates.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score each candidate.
    async fn score(
        &self,
        candidates: &[Candidate],
    ) -> Result<StageOutput<ScoredCandidate>, GapwatchError>;
}

/// Turns scored candidates into trade plans.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Build plans.
    async fn plan(&self, scored: &[ScoredCandidate]) -> Result<StageOutput<Plan>, GapwatchError>;
}

/// Evaluates plans against risk limits.
#[async_trait]
pub trait RiskGate: Send + Sync {
    /// Judge one plan. An error counts against that plan only.
    async fn evaluate_risk(&self, plan: &Plan) -> Result<Decision, GapwatchError>;
}

/// The full set of stages a coordinator runs.
#[derive(Clone)]
pub struct Stages {
    /// Universe resolution.
    pub universe: Arc<dyn UniverseResolver>,
    /// Candidate detection.
    pub scanner: Arc<dyn Scanner>,
    /// Scoring.
    pub scorer: Arc<dyn Scorer>,
    /// Planning.
    pub planner: Arc<dyn Planner>,
    /// Risk evaluation.
    pub risk: Arc<dyn RiskGate>,
}

impl Stages {
    /// Bundle the five stages.
    #[must_use]
    pub fn new(
        universe: Arc<dyn UniverseResolver>,
        scanner: Arc<dyn Scanner>,
        scorer: Arc<dyn Scorer>,
        planner: Arc<dyn Planner>,
        risk: Arc<dyn RiskGate>,
    ) -> Self {
        Self {
            universe,
            scanner,
            scorer,
            planner,
            risk,
        }
    }
}

impl std::fmt::Debug for Stages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stages").finish_non_exhaustive()
    }
}
