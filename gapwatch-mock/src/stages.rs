use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use gapwatch_core::{
    Candidate, Decision, GapwatchError, MarketSnapshot, Plan, Planner, RiskGate, ScoredCandidate,
    Scanner, Scorer, StageOutput, Symbol, UniverseResolver,
};

/// Universe resolver returning a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticUniverse(pub Vec<Symbol>);

impl StaticUniverse {
    /// From string symbols.
    pub fn of(symbols: &[&str]) -> Self {
        Self(symbols.iter().copied().map(Symbol::new).collect())
    }
}

#[async_trait]
impl UniverseResolver for StaticUniverse {
    async fn resolve_universe(&self) -> Result<Vec<Symbol>, GapwatchError> {
        Ok(self.0.clone())
    }
}

/// Universe resolver that always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingUniverse;

#[async_trait]
impl UniverseResolver for FailingUniverse {
    async fn resolve_universe(&self) -> Result<Vec<Symbol>, GapwatchError> {
        Err(GapwatchError::Other("universe source offline".into()))
    }
}

/// Flags symbols whose absolute gap is at least `min_gap_percent`.
///
/// Symbols with no quote, or a quote without a previous close, are reported
/// as per-item failures.
#[derive(Debug, Clone, Copy)]
pub struct GapScanner {
    /// Minimum absolute gap in percent.
    pub min_gap_percent: f64,
}

impl GapScanner {
    /// Scanner with the given threshold.
    #[must_use]
    pub const fn new(min_gap_percent: f64) -> Self {
        Self { min_gap_percent }
    }
}

#[async_trait]
impl Scanner for GapScanner {
    async fn scan(&self, data: &MarketSnapshot) -> Result<StageOutput<Candidate>, GapwatchError> {
        let mut out = StageOutput::default();
        for sym in &data.symbols {
            let Some(q) = data.quotes.get(sym) else {
                out.errors
                    .push(GapwatchError::step("scan", sym.as_str(), "no quote"));
                continue;
            };
            let (Some(pc), Some(gap)) = (q.previous_close, q.gap_percent()) else {
                out.errors
                    .push(GapwatchError::step("scan", sym.as_str(), "no previous close"));
                continue;
            };
            if gap.abs() >= self.min_gap_percent {
                out.items.push(Candidate {
                    symbol: sym.clone(),
                    price: q.price,
                    previous_close: pc,
                    gap_percent: gap,
                    volume: q.volume,
                });
            }
        }
        Ok(out)
    }
}

/// Blocks forever once entered; `entered` is notified first.
#[derive(Debug, Clone, Default)]
pub struct HangingScanner {
    /// Signalled when `scan` starts.
    pub entered: Arc<Notify>,
}

#[async_trait]
impl Scanner for HangingScanner {
    async fn scan(&self, _data: &MarketSnapshot) -> Result<StageOutput<Candidate>, GapwatchError> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(StageOutput::default())
    }
}

/// Scores by absolute gap. Symbols in `fail_on` fail individually.
#[derive(Debug, Clone, Default)]
pub struct GapScorer {
    /// Symbols that produce a per-item error.
    pub fail_on: HashSet<Symbol>,
}

impl GapScorer {
    /// Scorer that fails for the given symbols.
    pub fn failing_on(symbols: &[&str]) -> Self {
        Self {
            fail_on: symbols.iter().copied().map(Symbol::new).collect(),
        }
    }
}

#[async_trait]
impl Scorer for GapScorer {
    async fn score(
        &self,
        candidates: &[Candidate],
    ) -> Result<StageOutput<ScoredCandidate>, GapwatchError> {
        let mut out = StageOutput::default();
        for c in candidates {
            if self.fail_on.contains(&c.symbol) {
                out.errors
                    .push(GapwatchError::step("score", c.symbol.as_str(), "scoring model failed"));
                continue;
            }
            let gap = c.gap_percent.abs();
            let mut factors = BTreeMap::new();
            factors.insert("gap".to_string(), gap);
            out.items.push(ScoredCandidate {
                candidate: c.clone(),
                score: gap,
                factors,
            });
        }
        Ok(out)
    }
}

/// Fixed 2% stop, 4% target, 10k notional.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePlanner;

#[async_trait]
impl Planner for SimplePlanner {
    async fn plan(&self, scored: &[ScoredCandidate]) -> Result<StageOutput<Plan>, GapwatchError> {
        let items = scored
            .iter()
            .map(|s| {
                let entry = s.candidate.price;
                let quantity = if entry > 0.0 {
                    ((10_000.0 / entry).floor() as u64).max(1)
                } else {
                    1
                };
                Plan {
                    symbol: s.candidate.symbol.clone(),
                    entry,
                    stop: entry * 0.98,
                    target: entry * 1.04,
                    quantity,
                    score: s.score,
                }
            })
            .collect();
        Ok(StageOutput::ok(items))
    }
}

/// Approves plans scoring at least `min_score`.
///
/// Symbols in `fail_on` make `evaluate_risk` return an error.
#[derive(Debug, Clone, Default)]
pub struct ThresholdRiskGate {
    /// Minimum score for approval.
    pub min_score: f64,
    /// Symbols whose evaluation errors.
    pub fail_on: HashSet<Symbol>,
}

impl ThresholdRiskGate {
    /// Gate with the given minimum score.
    #[must_use]
    pub fn new(min_score: f64) -> Self {
        Self {
            min_score,
            fail_on: HashSet::new(),
        }
    }

    /// Make evaluation fail for `symbols`.
    #[must_use]
    pub fn failing_on(mut self, symbols: &[&str]) -> Self {
        self.fail_on
            .extend(symbols.iter().copied().map(Symbol::new));
        self
    }
}

#[async_trait]
impl RiskGate for ThresholdRiskGate {
    async fn evaluate_risk(&self, plan: &Plan) -> Result<Decision, GapwatchError> {
        if self.fail_on.contains(&plan.symbol) {
            return Err(GapwatchError::Other(format!(
                "risk service unavailable for {}",
                plan.symbol
            )));
        }
        if plan.score >= self.min_score {
            Ok(Decision::approve("score above threshold"))
        } else {
            Ok(Decision::reject(format!(
                "score {:.2} below {:.2}",
                plan.score, self.min_score
            )))
        }
    }
}
