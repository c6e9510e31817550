use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gapwatch::ProviderFallbackChain;
use gapwatch_core::{BackoffConfig, ChainConfig, ConnectionState, DataPriority, GapwatchError};
use gapwatch_mock::{DynamicMockProvider, MockBehavior, MockController, StreamBehavior, quote};
use tokio::time::{Instant, sleep, sleep_until};

use crate::helpers::{AAPL, MSFT, sym, syms};

const WS: &str = "ws";

fn chain_cfg() -> ChainConfig {
    ChainConfig {
        backoff: BackoffConfig {
            min_backoff_ms: 5_000,
            max_backoff_ms: 20_000,
            factor: 2,
            jitter_percent: 0,
        },
        ..ChainConfig::default()
    }
}

fn streaming_chain(rank: DataPriority) -> (ProviderFallbackChain, MockController) {
    let (p, ctl) = DynamicMockProvider::streaming_with_controller(WS, rank);
    let chain = ProviderFallbackChain::builder()
        .with_provider(p)
        .config(chain_cfg())
        .build()
        .unwrap();
    (chain, ctl)
}

fn refused() -> StreamBehavior {
    StreamBehavior::Fail(GapwatchError::stream_disconnect(WS, "connection refused"))
}

async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_follow_the_backoff_schedule() {
    let (chain, ctl) = streaming_chain(DataPriority::Realtime);
    ctl.set_stream_behavior(refused()).await;
    chain.subscribe_stream(&syms(&[AAPL]));

    let t0 = Instant::now();
    assert_eq!(chain.start_streaming().await, Some(WS));

    let checkpoints = [
        (1, 1),
        (4_999, 1),
        (5_001, 2),
        (15_001, 3),
        (34_999, 3),
        (35_001, 4),
        (55_001, 5),
        (75_001, 6),
    ];
    for (at_ms, expected) in checkpoints {
        sleep_until(t0 + Duration::from_millis(at_ms)).await;
        assert_eq!(
            ctl.stream_requests().await.len(),
            expected,
            "attempts at t={at_ms}ms"
        );
    }
    assert_eq!(*chain.connection_state().borrow(), ConnectionState::Backoff);

    chain.stop_streaming().await;
    assert_eq!(*chain.connection_state().borrow(), ConnectionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn a_delivered_message_resets_the_backoff() {
    let (chain, ctl) = streaming_chain(DataPriority::Realtime);
    ctl.set_stream_behavior(refused()).await;
    chain.subscribe_stream(&syms(&[AAPL]));
    let t0 = Instant::now();
    chain.start_streaming().await;

    sleep_until(t0 + Duration::from_millis(5_001)).await;
    assert_eq!(ctl.stream_requests().await.len(), 2);
    ctl.set_stream_behavior(StreamBehavior::Manual).await;

    sleep_until(t0 + Duration::from_millis(15_001)).await;
    assert_eq!(ctl.stream_requests().await.len(), 3);
    assert_eq!(*chain.connection_state().borrow(), ConnectionState::Connected);

    assert!(ctl.push_quote(quote(AAPL, 101.0, 100.0)).await);
    settle().await;
    let streamed = chain.latest_quote(&sym(AAPL)).unwrap();
    assert_eq!(streamed.provider, WS);
    assert!(!streamed.delayed);

    // Dropped right after a message: the next wait starts from the minimum again.
    ctl.set_stream_behavior(refused()).await;
    ctl.fail_stream().await;
    sleep_until(t0 + Duration::from_millis(20_000)).await;
    assert_eq!(ctl.stream_requests().await.len(), 3);
    sleep_until(t0 + Duration::from_millis(20_010)).await;
    assert_eq!(ctl.stream_requests().await.len(), 4);

    chain.stop_streaming().await;
}

#[tokio::test(start_paused = true)]
async fn symbol_changes_resubscribe_the_full_set() {
    let (chain, ctl) = streaming_chain(DataPriority::Realtime);
    ctl.set_stream_behavior(StreamBehavior::Manual).await;
    chain.subscribe_stream(&syms(&[AAPL]));
    chain.start_streaming().await;
    settle().await;
    assert_eq!(ctl.stream_requests().await, vec![syms(&[AAPL])]);

    chain.subscribe_stream(&syms(&[MSFT]));
    settle().await;
    assert_eq!(
        ctl.stream_requests().await,
        vec![syms(&[AAPL]), syms(&[AAPL, MSFT])]
    );
    assert_eq!(*chain.connection_state().borrow(), ConnectionState::Connected);

    // Re-adding known symbols is not a change.
    chain.subscribe_stream(&syms(&[MSFT]));
    settle().await;
    assert_eq!(ctl.stream_requests().await.len(), 2);
    assert_eq!(chain.streamed_symbols(), syms(&[AAPL, MSFT]));

    chain.unsubscribe_stream(&syms(&[AAPL, MSFT]));
    settle().await;
    assert_eq!(*chain.connection_state().borrow(), ConnectionState::Idle);
    assert_eq!(ctl.stream_requests().await.len(), 2);

    chain.stop_streaming().await;
}

#[tokio::test(start_paused = true)]
async fn streamed_quotes_feed_callbacks_and_lookups() {
    let (chain, ctl) = streaming_chain(DataPriority::Realtime);
    ctl.set_stream_behavior(StreamBehavior::Manual).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&seen);
    chain.on_quote(move |q| {
        assert_eq!(q.symbol.as_str(), AAPL);
        s.fetch_add(1, Ordering::SeqCst);
    });
    chain.subscribe_stream(&syms(&[AAPL]));
    chain.start_streaming().await;
    settle().await;

    ctl.push_quote(quote(AAPL, 123.0, 100.0)).await;
    // Not subscribed; filtered by the session.
    ctl.push_quote(quote(MSFT, 400.0, 390.0)).await;
    settle().await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(chain.latest_quotes().len(), 1);

    let q = chain.get_one(&sym(AAPL)).await.unwrap();
    assert_eq!(q.price, 123.0);
    assert_eq!(ctl.quote_calls(), 0);
    assert_eq!(ctl.health_checks(), 0);

    // Once the stream is down, lookups go back to polling.
    chain.stop_streaming().await;
    ctl.set_quote_behavior(AAPL, MockBehavior::Return(quote(AAPL, 99.0, 100.0)))
        .await;
    let q = chain.get_one(&sym(AAPL)).await.unwrap();
    assert_eq!(q.price, 99.0);
    assert_eq!(ctl.quote_calls(), 1);
    // The last streamed value is still readable.
    assert_eq!(chain.latest_quote(&sym(AAPL)).unwrap().price, 123.0);
}

#[tokio::test(start_paused = true)]
async fn delayed_stream_tags_quotes_as_delayed() {
    let (chain, ctl) = streaming_chain(DataPriority::Delayed);
    ctl.set_stream_behavior(StreamBehavior::Manual).await;
    chain.subscribe_stream(&syms(&[AAPL]));
    chain.start_streaming().await;
    settle().await;
    ctl.push_quote(quote(AAPL, 10.0, 9.0)).await;
    settle().await;
    assert!(chain.latest_quote(&sym(AAPL)).unwrap().delayed);
    chain.stop_streaming().await;
}

#[tokio::test(start_paused = true)]
async fn start_streaming_prefers_the_best_ranked_streamer_and_is_idempotent() {
    let (slow, slow_ctl) =
        DynamicMockProvider::streaming_with_controller("slow_ws", DataPriority::Delayed);
    let (fast, fast_ctl) = DynamicMockProvider::streaming_with_controller(WS, DataPriority::Realtime);
    let chain = ProviderFallbackChain::builder()
        .with_provider(slow)
        .with_provider(fast)
        .config(chain_cfg())
        .build()
        .unwrap();
    fast_ctl.set_stream_behavior(StreamBehavior::Manual).await;
    chain.subscribe_stream(&syms(&[AAPL]));

    assert_eq!(chain.start_streaming().await, Some(WS));
    settle().await;
    assert_eq!(chain.start_streaming().await, Some(WS));
    settle().await;
    assert_eq!(fast_ctl.stream_requests().await.len(), 1);
    assert!(slow_ctl.stream_requests().await.is_empty());
    chain.stop_streaming().await;
}

#[tokio::test]
async fn polled_only_chain_does_not_stream() {
    let (p, _ctl) = DynamicMockProvider::new_with_controller("rest", DataPriority::Realtime);
    let chain = ProviderFallbackChain::builder().with_provider(p).build().unwrap();
    assert_eq!(chain.start_streaming().await, None);
    assert_eq!(*chain.connection_state().borrow(), ConnectionState::Idle);
    chain.stop_streaming().await;
}
