mod helpers;

use std::sync::Arc;
use std::time::Duration;

use gapwatch::{Coordinator, EventBus, PipelineStep, ProviderFallbackChain, RunState};
use gapwatch_core::{
    CoordinatorConfig, DataPriority, Event, EventKind, EventPayload, EventPriority, GapwatchError,
    HistoryRequest, Interval, QuotaPeriod, Range, ScanKind, Severity, Stages,
};
use gapwatch_middleware::QuotaGuard;
use gapwatch_mock::{
    DynamicMockProvider, FailingUniverse, GapScanner, GapScorer, HangingScanner, MockBehavior,
    MockController, SimplePlanner, StaticUniverse, ThresholdRiskGate, quote,
};
use helpers::{
    AAPL, MSFT, NVDA, TSLA, coordinator_cfg, eventually, gap_stages, record, running_bus, sym, syms,
};

const LIVE: &str = "live";

struct Rig {
    bus: EventBus,
    chain: Arc<ProviderFallbackChain>,
    live: MockController,
}

async fn rig_with_quota(quota: QuotaGuard) -> Rig {
    let (p, live) = DynamicMockProvider::new_with_controller(LIVE, DataPriority::Realtime);
    let chain = ProviderFallbackChain::builder()
        .with_provider(p)
        .quota(Arc::new(quota))
        .build()
        .unwrap();
    Rig {
        bus: running_bus().await,
        chain: Arc::new(chain),
        live,
    }
}

async fn rig() -> Rig {
    rig_with_quota(QuotaGuard::builder().build().unwrap()).await
}

/// AAPL gaps 6%, MSFT 3.5%, TSLA 1%; NVDA has no quote.
async fn open_market(live: &MockController) {
    for (s, price) in [(AAPL, 106.0), (MSFT, 103.5), (TSLA, 101.0)] {
        live.set_quote_behavior(s, MockBehavior::Return(quote(s, price, 100.0)))
            .await;
    }
}

fn coordinator(r: &Rig, stages: Stages, cfg: CoordinatorConfig) -> Coordinator {
    Coordinator::new(r.bus.clone(), Arc::clone(&r.chain), stages, cfg)
}

fn statuses(events: &[Arc<Event>]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::SystemStatus { component, status, .. } if component == "coordinator" => {
                Some(status.clone())
            }
            _ => None,
        })
        .collect()
}

fn hanging_stages(scanner: HangingScanner) -> Stages {
    Stages::new(
        Arc::new(StaticUniverse::of(&[AAPL])),
        Arc::new(scanner),
        Arc::new(GapScorer::default()),
        Arc::new(SimplePlanner),
        Arc::new(ThresholdRiskGate::new(0.0)),
    )
}

#[tokio::test]
async fn completed_run_records_every_step() {
    let r = rig().await;
    open_market(&r.live).await;
    let signals = record(&r.bus, EventKind::StageSignal);
    let alerts = record(&r.bus, EventKind::RiskAlert);
    let status = record(&r.bus, EventKind::SystemStatus);
    let updates = record(&r.bus, EventKind::DataUpdate);
    let c = coordinator(&r, gap_stages(&[AAPL, MSFT, TSLA, NVDA]), coordinator_cfg());

    let run = c.run_scan(ScanKind::Primary, None).await;
    r.bus.stop().await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.kind, ScanKind::Primary);
    assert!(run.finished_at.is_some());
    assert_eq!(run.count(PipelineStep::Universe), 4);
    assert_eq!(run.count(PipelineStep::Fetch), 3);
    assert_eq!(run.count(PipelineStep::Scan), 2);
    assert_eq!(run.count(PipelineStep::Score), 2);
    assert_eq!(run.count(PipelineStep::Plan), 2);
    assert_eq!(run.count(PipelineStep::Risk), 1);
    assert_eq!(run.count(PipelineStep::Signal), 1);
    assert_eq!(run.accepted_plans.len(), 1);
    assert_eq!(run.accepted_plans[0].symbol, sym(AAPL));

    // NVDA fails at fetch and again at scan; the run still completes.
    assert_eq!(run.step_errors(PipelineStep::Fetch).len(), 1);
    assert_eq!(run.step_errors(PipelineStep::Scan).len(), 1);
    assert_eq!(run.errors.len(), 2);

    let signals = signals.lock().unwrap();
    assert_eq!(signals.len(), 1);
    assert!(matches!(&signals[0].payload, EventPayload::StageSignal { plan } if plan.symbol == sym(AAPL)));

    let alerts = alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    match &alerts[0].payload {
        EventPayload::RiskAlert {
            alert_type,
            severity,
            affected_symbols,
            ..
        } => {
            assert_eq!(alert_type, "trade_rejected");
            assert_eq!(*severity, Severity::Warning);
            assert_eq!(affected_symbols, &syms(&[MSFT]));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    let status = status.lock().unwrap();
    assert_eq!(statuses(&status), vec!["scan_started", "scan_completed"]);
    let done = status.iter().rev().find_map(|e| match &e.payload {
        EventPayload::SystemStatus { metrics, .. } => Some(metrics.clone()),
        _ => None,
    });
    let metrics = done.unwrap();
    assert_eq!(metrics["signal"], 1);
    assert_eq!(metrics["accepted"], 1);
    assert_eq!(metrics["run_id"], run.id);

    let updates = updates.lock().unwrap();
    let kinds: Vec<&str> = updates
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::DataUpdate { data_type, .. } => Some(data_type.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(kinds.iter().filter(|k| **k == "quote").count(), 3);
    assert_eq!(kinds.iter().filter(|k| **k == "score").count(), 2);

    assert_eq!(c.state(), RunState::Idle);
    assert_eq!(c.last_run().unwrap().id, run.id);
}

#[tokio::test]
async fn explicit_universe_overrides_resolution() {
    let r = rig().await;
    open_market(&r.live).await;
    let c = coordinator(&r, gap_stages(&[AAPL, MSFT, TSLA, NVDA]), coordinator_cfg());

    let run = c.run_scan(ScanKind::Manual, Some(syms(&[AAPL]))).await;
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.count(PipelineStep::Universe), 1);
    assert!(run.errors.is_empty());
    r.bus.stop().await;
}

#[tokio::test]
async fn universe_failure_fails_the_run() {
    let r = rig().await;
    let errors = record(&r.bus, EventKind::Error);
    let stages = Stages::new(
        Arc::new(FailingUniverse),
        Arc::new(GapScanner::new(3.0)),
        Arc::new(GapScorer::default()),
        Arc::new(SimplePlanner),
        Arc::new(ThresholdRiskGate::new(4.0)),
    );
    let c = coordinator(&r, stages, coordinator_cfg());

    let run = c.run_scan(ScanKind::Primary, None).await;
    r.bus.stop().await;
    assert_eq!(run.state, RunState::Failed);
    assert!(matches!(run.errors.last(), Some(GapwatchError::Other(msg)) if msg.contains("offline")));
    assert_eq!(run.count(PipelineStep::Fetch), 0);
    assert_eq!(r.live.quote_calls(), 0);
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert_eq!(c.state(), RunState::Idle);
}

#[tokio::test]
async fn per_item_failures_do_not_fail_the_run() {
    let r = rig().await;
    for (s, price) in [(AAPL, 106.0), (TSLA, 108.0), (MSFT, 105.0)] {
        r.live
            .set_quote_behavior(s, MockBehavior::Return(quote(s, price, 100.0)))
            .await;
    }
    let stages = Stages::new(
        Arc::new(StaticUniverse::of(&[AAPL, TSLA, MSFT])),
        Arc::new(GapScanner::new(3.0)),
        Arc::new(GapScorer::failing_on(&[AAPL])),
        Arc::new(SimplePlanner),
        Arc::new(ThresholdRiskGate::new(4.0).failing_on(&[MSFT])),
    );
    let c = coordinator(&r, stages, coordinator_cfg());

    let run = c.run_scan(ScanKind::SecondLook, None).await;
    r.bus.stop().await;
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.step_errors(PipelineStep::Score).len(), 1);
    let risk = run.step_errors(PipelineStep::Risk);
    assert_eq!(risk.len(), 1);
    assert!(matches!(risk[0], GapwatchError::StepError { item, .. } if item == MSFT));
    assert_eq!(run.accepted_plans.len(), 1);
    assert_eq!(run.accepted_plans[0].symbol, sym(TSLA));
}

#[tokio::test]
async fn only_the_best_plans_reach_the_risk_gate() {
    let r = rig().await;
    let universe = [AAPL, MSFT, TSLA, NVDA, "AMD"];
    for (i, s) in universe.iter().enumerate() {
        let price = 105.0 + i as f64;
        r.live
            .set_quote_behavior(*s, MockBehavior::Return(quote(s, price, 100.0)))
            .await;
    }
    let cfg = CoordinatorConfig {
        max_plans: 2,
        ..coordinator_cfg()
    };
    let c = coordinator(&r, gap_stages(&universe), cfg);

    let run = c.run_scan(ScanKind::Primary, None).await;
    r.bus.stop().await;
    assert_eq!(run.count(PipelineStep::Score), 5);
    assert_eq!(run.count(PipelineStep::Plan), 2);
    let mut accepted: Vec<_> = run.accepted_plans.iter().map(|p| p.symbol.clone()).collect();
    accepted.sort();
    assert_eq!(accepted, syms(&["AMD", NVDA]));
}

#[tokio::test]
async fn history_is_fetched_when_configured() {
    let r = rig().await;
    open_market(&r.live).await;
    let cfg = CoordinatorConfig {
        history: Some(HistoryRequest::new(Range::D5, Interval::D1)),
        ..coordinator_cfg()
    };
    let c = coordinator(&r, gap_stages(&[AAPL, MSFT]), cfg);

    let run = c.run_scan(ScanKind::Primary, None).await;
    r.bus.stop().await;
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(r.live.history_calls(), 2);
}

#[tokio::test]
async fn quota_pressure_is_published_after_fetch() {
    let quota = QuotaGuard::builder()
        .provider(LIVE, 10, QuotaPeriod::Day)
        .build()
        .unwrap();
    let r = rig_with_quota(quota).await;
    open_market(&r.live).await;
    r.chain.quota().consume_quota(LIVE, 6, "seed").await.unwrap();
    let warnings = record(&r.bus, EventKind::QuotaWarning);
    let c = coordinator(&r, gap_stages(&[AAPL, MSFT, TSLA]), coordinator_cfg());

    c.run_scan(ScanKind::Primary, None).await;
    r.bus.stop().await;
    let warnings = warnings.lock().unwrap();
    assert_eq!(warnings.len(), 1);
    match &warnings[0].payload {
        EventPayload::QuotaWarning {
            provider,
            remaining_calls,
            ..
        } => {
            assert_eq!(provider, LIVE);
            assert_eq!(*remaining_calls, 1);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn quota_warnings_use_the_configured_threshold() {
    let quota = QuotaGuard::builder()
        .provider(LIVE, 100, QuotaPeriod::Day)
        .warn_percent(50.0)
        .build()
        .unwrap();
    let r = rig_with_quota(quota).await;
    open_market(&r.live).await;
    r.chain.quota().consume_quota(LIVE, 60, "seed").await.unwrap();
    let warnings = record(&r.bus, EventKind::QuotaWarning);
    let c = coordinator(&r, gap_stages(&[AAPL, MSFT, TSLA]), coordinator_cfg());

    c.run_scan(ScanKind::Primary, None).await;
    r.bus.stop().await;
    let warnings = warnings.lock().unwrap();
    assert_eq!(warnings.len(), 1);
    // Below the default threshold, above the configured one.
    assert_eq!(warnings[0].priority, EventPriority::High);
    match &warnings[0].payload {
        EventPayload::QuotaWarning { usage_percent, .. } => {
            assert!(*usage_percent > 50.0 && *usage_percent < 80.0, "{usage_percent}");
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_fails_the_run_and_keeps_partial_progress() {
    let r = rig().await;
    open_market(&r.live).await;
    let errors = record(&r.bus, EventKind::Error);
    let status = record(&r.bus, EventKind::SystemStatus);
    let cfg = CoordinatorConfig {
        run_deadline_ms: 1_000,
        ..CoordinatorConfig::default()
    };
    let c = coordinator(&r, hanging_stages(HangingScanner::default()), cfg);

    let run = c.run_scan(ScanKind::Primary, None).await;
    r.bus.stop().await;
    assert_eq!(run.state, RunState::Failed);
    match run.errors.last() {
        Some(GapwatchError::RunTimeout { elapsed_ms }) => assert!(*elapsed_ms >= 1_000),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(run.count(PipelineStep::Universe), 1);
    assert_eq!(run.count(PipelineStep::Fetch), 1);
    assert_eq!(run.count(PipelineStep::Scan), 0);

    assert_eq!(statuses(&status.lock().unwrap()), vec!["scan_started", "scan_failed"]);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0].payload, EventPayload::Error { component, .. } if component == "coordinator"));
}

#[tokio::test(start_paused = true)]
async fn new_run_cancels_the_active_one() {
    let r = rig().await;
    open_market(&r.live).await;
    let status = record(&r.bus, EventKind::SystemStatus);
    let scanner = HangingScanner::default();
    let entered = Arc::clone(&scanner.entered);
    let cfg = CoordinatorConfig {
        run_deadline_ms: 5_000,
        ..CoordinatorConfig::default()
    };
    let c = coordinator(&r, hanging_stages(scanner), cfg);

    let first = tokio::spawn({
        let c = c.clone();
        async move { c.run_scan(ScanKind::Primary, None).await }
    });
    entered.notified().await;
    assert_eq!(c.state(), RunState::Running);

    let second = c.run_scan(ScanKind::Manual, None).await;
    let first = first.await.unwrap();
    r.bus.stop().await;

    assert_eq!(first.state, RunState::Cancelled);
    assert!(first.finished_at.is_some());
    // The replacement hangs in the same scanner until its deadline.
    assert_eq!(second.state, RunState::Failed);
    assert!(second.id > first.id);

    let history = c.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first.id);
    assert_eq!(history[1].id, second.id);
    assert_eq!(
        statuses(&status.lock().unwrap()),
        vec!["scan_started", "scan_cancelled", "scan_started", "scan_failed"]
    );
    assert_eq!(c.state(), RunState::Idle);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_the_active_run() {
    let r = rig().await;
    open_market(&r.live).await;
    let scanner = HangingScanner::default();
    let entered = Arc::clone(&scanner.entered);
    let c = coordinator(&r, hanging_stages(scanner), coordinator_cfg());
    c.start();

    r.bus.publish(Event::scan_request("test", ScanKind::Manual, None));
    entered.notified().await;
    c.stop().await;

    let last = c.last_run().unwrap();
    assert_eq!(last.state, RunState::Cancelled);
    assert_eq!(c.state(), RunState::Idle);
    r.bus.stop().await;
}

#[tokio::test]
async fn second_scan_request_on_the_bus_cancels_the_first() {
    let r = rig().await;
    open_market(&r.live).await;
    let scanner = HangingScanner::default();
    let entered = Arc::clone(&scanner.entered);
    let cfg = CoordinatorConfig {
        run_deadline_ms: 60_000,
        ..coordinator_cfg()
    };
    let c = coordinator(&r, hanging_stages(scanner), cfg);
    c.start();

    r.bus.publish(Event::scan_request("test", ScanKind::Primary, None));
    entered.notified().await;
    r.bus.publish(Event::scan_request("test", ScanKind::Manual, None));
    entered.notified().await;

    let first = c.last_run().unwrap();
    assert_eq!(first.kind, ScanKind::Primary);
    assert_eq!(first.state, RunState::Cancelled);
    assert_eq!(c.state(), RunState::Running);

    c.stop().await;
    let history = c.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].kind, ScanKind::Manual);
    assert!(history[1].id > history[0].id);
    r.bus.stop().await;
}

#[tokio::test]
async fn back_to_back_scan_requests_leave_the_newest_running() {
    let r = rig().await;
    open_market(&r.live).await;
    let status = record(&r.bus, EventKind::SystemStatus);
    let scanner = HangingScanner::default();
    let cfg = CoordinatorConfig {
        run_deadline_ms: 60_000,
        ..coordinator_cfg()
    };
    let c = coordinator(&r, hanging_stages(scanner), cfg);
    c.start();

    for kind in [ScanKind::Primary, ScanKind::SecondLook, ScanKind::Manual] {
        r.bus.publish(Event::scan_request("test", kind, None));
    }
    eventually(Duration::from_secs(5), || {
        status.lock().unwrap().iter().any(|e| {
            matches!(&e.payload, EventPayload::SystemStatus { status: s, message, .. }
                if s == "scan_started" && message.starts_with("manual "))
        })
    })
    .await;
    c.stop().await;

    let history = c.history();
    let (last, earlier) = history.split_last().unwrap();
    assert_eq!(last.kind, ScanKind::Manual);
    assert!(
        earlier.iter().all(|run| run.state == RunState::Cancelled),
        "{earlier:?}"
    );
    // Nothing started after the newest request.
    assert_eq!(history.iter().filter(|run| run.kind == ScanKind::Manual).count(), 1);
    r.bus.stop().await;
}

#[tokio::test]
async fn scan_requests_on_the_bus_start_runs() {
    let r = rig().await;
    open_market(&r.live).await;
    let c = coordinator(&r, gap_stages(&[AAPL, MSFT]), coordinator_cfg());
    c.start();
    c.start();

    r.bus.publish(Event::scan_request("test", ScanKind::Primary, Some(syms(&[AAPL]))));
    eventually(Duration::from_secs(5), || c.history().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    // A second subscription would have started a second run.
    assert_eq!(c.history().len(), 1);
    let run = c.last_run().unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.count(PipelineStep::Universe), 1);

    c.stop().await;
    r.bus.publish(Event::scan_request("test", ScanKind::Primary, None));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(c.history().len(), 1);
    r.bus.stop().await;
}
