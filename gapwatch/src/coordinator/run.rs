//! One pass through the pipeline.
//!
//! Progress is written into a shared [`WorkflowRun`] as each step finishes so
//! that a run aborted by its deadline still reports what it got through.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use gapwatch_core::{
    CoordinatorConfig, Event, GapwatchError, MarketSnapshot, Severity, Stages, Symbol,
};
use tokio_util::sync::CancellationToken;

use super::state::{PipelineStep, WorkflowRun};
use crate::bus::EventBus;
use crate::chain::ProviderFallbackChain;

const SOURCE: &str = "coordinator";

pub(crate) struct RunContext {
    pub bus: EventBus,
    pub chain: Arc<ProviderFallbackChain>,
    pub stages: Stages,
    pub cfg: CoordinatorConfig,
}

pub(crate) type Recorder = Arc<Mutex<WorkflowRun>>;

fn record(rec: &Recorder, f: impl FnOnce(&mut WorkflowRun)) {
    f(&mut rec.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Race `fut` against cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, GapwatchError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(GapwatchError::Cancelled),
        v = fut => Ok(v),
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), GapwatchError> {
    if cancel.is_cancelled() {
        Err(GapwatchError::Cancelled)
    } else {
        Ok(())
    }
}

/// Execute every step. `Err` ends the run; per-item failures land in the recorder.
pub(crate) async fn execute(
    ctx: &RunContext,
    rec: &Recorder,
    universe: Option<Vec<Symbol>>,
    cancel: &CancellationToken,
) -> Result<(), GapwatchError> {
    let stages = &ctx.stages;

    let symbols = match universe {
        Some(s) => s,
        None => cancellable(cancel, stages.universe.resolve_universe()).await??,
    };
    record(rec, |r| {
        r.counts.insert(PipelineStep::Universe, symbols.len());
    });
    tracing::debug!(symbols = symbols.len(), "universe resolved");

    checkpoint(cancel)?;
    let snapshot = cancellable(cancel, fetch(ctx, rec, symbols, cancel)).await??;

    checkpoint(cancel)?;
    let scanned = cancellable(cancel, stages.scanner.scan(&snapshot)).await??;
    record(rec, |r| {
        r.counts.insert(PipelineStep::Scan, scanned.items.len());
        r.errors.extend(scanned.errors);
    });

    checkpoint(cancel)?;
    let scored = cancellable(cancel, stages.scorer.score(&scanned.items)).await??;
    for s in &scored.items {
        let data = serde_json::to_value(s).unwrap_or_default();
        ctx.bus.publish(Event::data_update(SOURCE, s.candidate.symbol.clone(), "score", data));
    }
    record(rec, |r| {
        r.counts.insert(PipelineStep::Score, scored.items.len());
        r.errors.extend(scored.errors);
    });

    checkpoint(cancel)?;
    let mut ranked = scored.items;
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    let planned = cancellable(cancel, stages.planner.plan(&ranked)).await??;
    let mut plans = planned.items;
    plans.sort_by(|a, b| b.score.total_cmp(&a.score));
    plans.truncate(ctx.cfg.max_plans);
    record(rec, |r| {
        r.counts.insert(PipelineStep::Plan, plans.len());
        r.errors.extend(planned.errors);
    });

    let mut accepted = Vec::new();
    for plan in plans {
        checkpoint(cancel)?;
        match cancellable(cancel, stages.risk.evaluate_risk(&plan)).await? {
            Ok(d) if d.approved => accepted.push(plan),
            Ok(d) => {
                tracing::info!(symbol = %plan.symbol, reason = %d.reason, "plan rejected by risk gate");
                ctx.bus.publish(Event::risk_alert(
                    SOURCE,
                    "trade_rejected",
                    Severity::Warning,
                    d.reason,
                    vec![plan.symbol.clone()],
                ));
            }
            Err(e) => {
                tracing::warn!(symbol = %plan.symbol, error = %e, "risk evaluation failed");
                record(rec, |r| {
                    r.errors.push(GapwatchError::step(
                        PipelineStep::Risk.as_str(),
                        plan.symbol.as_str(),
                        e.to_string(),
                    ));
                });
            }
        }
    }
    record(rec, |r| {
        r.counts.insert(PipelineStep::Risk, accepted.len());
    });

    checkpoint(cancel)?;
    for plan in &accepted {
        ctx.bus.publish(Event::stage_signal(SOURCE, plan.clone()));
    }
    record(rec, |r| {
        r.counts.insert(PipelineStep::Signal, accepted.len());
        r.accepted_plans = accepted;
    });
    Ok(())
}

async fn fetch(
    ctx: &RunContext,
    rec: &Recorder,
    symbols: Vec<Symbol>,
    cancel: &CancellationToken,
) -> Result<MarketSnapshot, GapwatchError> {
    let quotes = ctx.chain.get_many(&symbols).await;
    for q in quotes.values() {
        let data = serde_json::to_value(q).unwrap_or_default();
        ctx.bus.publish(Event::data_update(SOURCE, q.symbol.clone(), "quote", data));
    }
    let missing: Vec<GapwatchError> = symbols
        .iter()
        .filter(|s| !quotes.contains_key(*s))
        .map(|s| GapwatchError::step(PipelineStep::Fetch.as_str(), s.as_str(), "no quote available"))
        .collect();

    let mut bars = HashMap::new();
    if let Some(req) = ctx.cfg.history {
        for s in &symbols {
            checkpoint(cancel)?;
            let got = ctx.chain.get_history(s, req.range, req.interval).await;
            if !got.is_empty() {
                bars.insert(s.clone(), got);
            }
        }
    }

    let quota = ctx.chain.quota();
    for snap in quota.warnings() {
        ctx.bus.publish(Event::quota_warning_over(
            SOURCE,
            snap.provider.clone(),
            snap.usage_percent,
            snap.remaining,
            snap.resets_at,
            quota.warn_percent(),
        ));
    }

    record(rec, |r| {
        r.counts.insert(PipelineStep::Fetch, quotes.len());
        r.errors.extend(missing);
    });
    Ok(MarketSnapshot {
        symbols,
        quotes,
        bars,
    })
}
