use std::sync::Arc;
use std::time::Duration;

use gapwatch::{EventKind, EventPayload, GapwatchConfig, Runtime, ScanKind, Stages, handler_fn};
use gapwatch_core::{DataPriority, QuotaLimit, QuotaPeriod};
use gapwatch_mock::{
    DynamicMockProvider, GapScanner, GapScorer, MockBehavior, SimplePlanner, StaticUniverse,
    ThresholdRiskGate, quote,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "gapwatch=info".into()))
        .init();

    // 1. A mock provider with a few pre-market gaps.
    let (provider, ctl) = DynamicMockProvider::new_with_controller("demo_feed", DataPriority::Realtime);
    for (sym, price) in [("AAPL", 106.2), ("MSFT", 103.8), ("TSLA", 98.9), ("NVDA", 111.0)] {
        ctl.set_quote_behavior(sym, MockBehavior::Return(quote(sym, price, 100.0)))
            .await;
    }

    // 2. Configuration: track the feed's quota, keep everything else default.
    let mut cfg = GapwatchConfig::default();
    cfg.quota.providers = vec![QuotaLimit::new("demo_feed", 50, QuotaPeriod::Day)];

    let stages = Stages::new(
        Arc::new(StaticUniverse::of(&["AAPL", "MSFT", "TSLA", "NVDA"])),
        Arc::new(GapScanner::new(3.0)),
        Arc::new(GapScorer::default()),
        Arc::new(SimplePlanner),
        Arc::new(ThresholdRiskGate::new(5.0)),
    );
    let runtime = Runtime::builder(cfg)
        .with_provider(provider)
        .stages(stages)
        .build()?;

    // 3. Print every accepted plan.
    runtime.bus().subscribe(
        EventKind::StageSignal,
        "printer",
        handler_fn(|ev| async move {
            if let EventPayload::StageSignal { plan } = &ev.payload {
                println!("signal: {plan:?}");
            }
            Ok(())
        }),
    );

    runtime.start().await;
    runtime.scheduler().trigger_manual(ScanKind::Manual);
    tokio::time::sleep(Duration::from_millis(500)).await;

    if let Some(run) = runtime.coordinator().last_run() {
        println!("run {} finished as {:?}", run.id, run.state);
        println!("counts: {:?}", run.counts);
        for e in &run.errors {
            println!("error: {e}");
        }
    }
    println!("quota: {:#?}", runtime.quota().status());

    runtime.shutdown().await?;
    Ok(())
}
