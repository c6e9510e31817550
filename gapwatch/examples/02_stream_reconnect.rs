use std::time::Duration;

use gapwatch::{ProviderFallbackChain, Symbol};
use gapwatch_core::{BackoffConfig, ChainConfig, DataPriority, GapwatchError};
use gapwatch_mock::{DynamicMockProvider, StreamBehavior, quote};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let (provider, ctl) = DynamicMockProvider::streaming_with_controller("demo_ws", DataPriority::Realtime);
    let chain = ProviderFallbackChain::builder()
        .with_provider(provider)
        .config(ChainConfig {
            backoff: BackoffConfig {
                min_backoff_ms: 200,
                max_backoff_ms: 1_000,
                factor: 2,
                jitter_percent: 10,
            },
            ..ChainConfig::default()
        })
        .build()?;

    chain.on_quote(|q| println!("quote: {} {:.2}", q.symbol, q.price));
    chain.subscribe_stream(&[Symbol::new("AAPL")]);

    // Refuse the first connections so the supervisor backs off.
    ctl.set_stream_behavior(StreamBehavior::Fail(GapwatchError::stream_disconnect(
        "demo_ws",
        "connection refused",
    )))
    .await;
    let mut state = chain.connection_state();
    let watcher = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            println!("connection: {}", state.borrow_and_update().as_str());
        }
    });

    chain.start_streaming().await;
    tokio::time::sleep(Duration::from_millis(700)).await;

    ctl.set_stream_behavior(StreamBehavior::Manual).await;
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    for price in [101.0, 101.5, 102.25] {
        ctl.push_quote(quote("AAPL", price, 100.0)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    chain.stop_streaming().await;
    watcher.abort();
    println!("attempts: {}", ctl.stream_requests().await.len());
    Ok(())
}
