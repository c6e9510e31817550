mod helpers;

use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gapwatch::{EventBus, filter_fn, handler_fn};
use chrono::TimeDelta;
use gapwatch_core::{
    BusConfig, Event, EventKind, EventPayload, EventPriority, GapwatchError, ScanKind,
};
use gapwatch_mock::ManualClock;
use helpers::{AAPL, MSFT, dt, eventually, record, running_bus, sym};
use proptest::prelude::*;
use serde_json::json;
use tokio::sync::Notify;

const PRIORITIES: [EventPriority; 4] = [
    EventPriority::Low,
    EventPriority::Normal,
    EventPriority::High,
    EventPriority::Critical,
];

fn numbered(i: usize) -> Event {
    Event::data_update("test", sym(AAPL), "seq", json!(i))
}

fn index_of(ev: &Event) -> Option<usize> {
    match &ev.payload {
        EventPayload::DataUpdate { data, .. } => data.as_u64().map(|v| v as usize),
        _ => None,
    }
}

/// Subscribes a handler that parks on the first "gate" event until released,
/// recording the index of every other event in dispatch order.
fn gated_recorder(bus: &EventBus) -> (Arc<Notify>, Arc<Notify>, Arc<Mutex<Vec<usize>>>) {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    let (e, r, o) = (Arc::clone(&entered), Arc::clone(&release), Arc::clone(&order));
    bus.subscribe(
        EventKind::DataUpdate,
        "gated",
        handler_fn(move |ev: Arc<Event>| {
            let (e, r, o) = (Arc::clone(&e), Arc::clone(&r), Arc::clone(&o));
            async move {
                match index_of(&ev) {
                    Some(i) => o.lock().unwrap().push(i),
                    None => {
                        e.notify_one();
                        r.notified().await;
                    }
                }
                Ok(())
            }
        }),
    );
    (entered, release, order)
}

fn explode(_ev: &Event) -> Result<(), GapwatchError> {
    panic!("kaboom")
}

fn gate() -> Event {
    Event::data_update("test", sym(AAPL), "gate", json!("gate"))
}

async fn dispatch_order(prios: &[EventPriority]) -> Vec<usize> {
    let bus = running_bus().await;
    let (entered, release, order) = gated_recorder(&bus);
    assert!(bus.publish(gate()));
    entered.notified().await;

    for (i, p) in prios.iter().enumerate() {
        assert!(bus.publish_with_priority(numbered(i), *p));
    }
    release.notify_one();
    let n = prios.len();
    eventually(Duration::from_secs(5), || order.lock().unwrap().len() == n).await;
    bus.stop().await;
    order.lock().unwrap().clone()
}

fn expected_order(prios: &[EventPriority]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..prios.len()).collect();
    // Stable sort keeps publish order inside one priority.
    idx.sort_by_key(|&i| Reverse(prios[i]));
    idx
}

#[tokio::test]
async fn dispatches_by_priority_then_publish_order() {
    use EventPriority::{Critical, High, Low, Normal};
    let prios = [Low, Normal, Critical, Normal, High, Low, Critical, High];
    let got = dispatch_order(&prios).await;
    assert_eq!(got, vec![2, 6, 4, 7, 1, 3, 0, 5]);
    assert_eq!(got, expected_order(&prios));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn dispatch_order_matches_stable_priority_sort(raw in prop::collection::vec(0usize..4, 1..40)) {
        let prios: Vec<EventPriority> = raw.into_iter().map(|i| PRIORITIES[i]).collect();
        let got = tokio_test::block_on(dispatch_order(&prios));
        prop_assert_eq!(got, expected_order(&prios));
    }
}

#[tokio::test]
async fn failing_handler_does_not_starve_siblings() {
    let bus = running_bus().await;
    let good = Arc::new(AtomicUsize::new(0));
    let g = Arc::clone(&good);
    bus.subscribe(
        EventKind::DataUpdate,
        "bad",
        handler_fn(|_ev: Arc<Event>| async { Err(GapwatchError::Other("boom".into())) }),
    );
    bus.subscribe(
        EventKind::DataUpdate,
        "good",
        handler_fn(move |_ev: Arc<Event>| {
            let g = Arc::clone(&g);
            async move {
                g.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    let errors = record(&bus, EventKind::Error);

    for i in 0..50 {
        bus.publish(numbered(i));
    }
    eventually(Duration::from_secs(5), || errors.lock().unwrap().len() == 50).await;
    assert_eq!(good.load(Ordering::SeqCst), 50);
    assert_eq!(bus.metrics().events_failed, 50);

    let first = errors.lock().unwrap()[0].clone();
    match &first.payload {
        EventPayload::Error { component, message, .. } => {
            assert_eq!(component, "event_bus");
            assert!(message.contains("bad"), "message: {message}");
            assert!(message.contains("boom"), "message: {message}");
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    bus.stop().await;
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let bus = running_bus().await;
    let good = Arc::new(AtomicUsize::new(0));
    let g = Arc::clone(&good);
    bus.subscribe(
        EventKind::StageSignal,
        "panicky",
        handler_fn(|ev: Arc<Event>| async move { explode(&ev) }),
    );
    bus.subscribe_all(
        "counter",
        handler_fn(move |ev: Arc<Event>| {
            let g = Arc::clone(&g);
            async move {
                if ev.kind() == EventKind::ScanRequest {
                    g.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        }),
    );
    let errors = record(&bus, EventKind::Error);

    let plan = gapwatch_core::Plan {
        symbol: sym(AAPL),
        entry: 100.0,
        stop: 98.0,
        target: 104.0,
        quantity: 100,
        score: 5.0,
    };
    bus.publish(Event::stage_signal("test", plan));
    bus.publish(Event::scan_request("test", ScanKind::Manual, None));

    eventually(Duration::from_secs(5), || errors.lock().unwrap().len() == 1).await;
    eventually(Duration::from_secs(5), || good.load(Ordering::SeqCst) == 1).await;
    let ev = errors.lock().unwrap()[0].clone();
    match &ev.payload {
        EventPayload::Error { message, .. } => assert!(message.contains("kaboom")),
        other => panic!("unexpected payload: {other:?}"),
    }
    assert!(bus.is_running());
    bus.stop().await;
}

#[tokio::test]
async fn failures_while_handling_error_events_do_not_loop() {
    let bus = running_bus().await;
    bus.subscribe_all(
        "always_fails",
        handler_fn(|_ev: Arc<Event>| async { Err(GapwatchError::Other("nope".into())) }),
    );
    bus.publish(numbered(0));

    eventually(Duration::from_secs(5), || bus.metrics().events_processed == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let m = bus.metrics();
    assert_eq!(m.events_published, 2);
    assert_eq!(m.events_processed, 2);
    assert_eq!(m.events_failed, 2);
    bus.stop().await;
}

#[tokio::test]
async fn full_queue_drops_and_counts() {
    let bus = EventBus::with_limits(2, Duration::from_secs(1));
    bus.start().await;
    let (entered, release, order) = gated_recorder(&bus);
    assert!(bus.publish(gate()));
    entered.notified().await;

    let accepted: Vec<bool> = (0..5).map(|i| bus.publish(numbered(i))).collect();
    assert_eq!(accepted, vec![true, true, false, false, false]);
    let m = bus.metrics();
    assert_eq!(m.events_dropped, 3);
    assert_eq!(m.queue_size, 2);

    release.notify_one();
    eventually(Duration::from_secs(5), || order.lock().unwrap().len() == 2).await;
    assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    bus.stop().await;
}

#[tokio::test]
async fn publish_times_come_from_the_bus_clock() {
    let clock = Arc::new(ManualClock::new(dt(2024, 5, 2, 14, 0, 0)));
    let bus = EventBus::with_clock(&BusConfig::default(), clock.clone());
    bus.start().await;
    let seen = record(&bus, EventKind::SystemStatus);

    bus.publish(Event::system_status("test", "first", ""));
    clock.advance(TimeDelta::minutes(5));
    bus.publish(Event::system_status("test", "second", ""));
    eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 2).await;
    bus.stop().await;

    let stamps: Vec<_> = seen.lock().unwrap().iter().map(|e| e.timestamp).collect();
    assert_eq!(stamps, vec![dt(2024, 5, 2, 14, 0, 0), dt(2024, 5, 2, 14, 5, 0)]);
}

#[tokio::test]
async fn publishing_to_a_stopped_bus_is_a_counted_drop() {
    let bus = EventBus::default();
    assert!(!bus.is_running());
    assert!(!bus.publish(numbered(0)));
    assert_eq!(bus.metrics().events_dropped, 1);
    assert_eq!(bus.metrics().events_published, 0);
}

#[tokio::test]
async fn stop_drains_queued_events() {
    let bus = running_bus().await;
    let seen = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&seen);
    bus.subscribe(
        EventKind::DataUpdate,
        "slow",
        handler_fn(move |_ev: Arc<Event>| {
            let s = Arc::clone(&s);
            async move {
                tokio::time::sleep(Duration::from_millis(3)).await;
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    for i in 0..20 {
        bus.publish(numbered(i));
    }
    bus.stop().await;

    assert_eq!(seen.load(Ordering::SeqCst), 20);
    let m = bus.metrics();
    assert_eq!(m.events_processed, 20);
    assert_eq!(m.events_dropped, 0);
    assert!(!bus.is_running());
    assert!(!bus.publish(numbered(99)));
}

#[tokio::test(start_paused = true)]
async fn drain_timeout_discards_the_backlog() {
    let bus = EventBus::with_limits(16, Duration::from_millis(50));
    bus.start().await;
    let (entered, _release, _order) = gated_recorder(&bus);
    bus.publish(gate());
    entered.notified().await;
    bus.publish(numbered(0));
    bus.publish(numbered(1));

    bus.stop().await;
    let m = bus.metrics();
    assert_eq!(m.events_dropped, 2);
    assert_eq!(m.queue_size, 0);
}

#[tokio::test]
async fn wait_for_returns_first_matching_event() {
    let bus = running_bus().await;
    let publisher = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        publisher.publish(Event::system_status("warmup", "warming", "not yet"));
        publisher.publish(Event::system_status("warmup", "ready", "go"));
    });

    let filter = filter_fn(|e: &Event| {
        matches!(&e.payload, EventPayload::SystemStatus { status, .. } if status == "ready")
    });
    let got = bus
        .wait_for(EventKind::SystemStatus, Duration::from_secs(2), Some(filter))
        .await
        .expect("ready status");
    assert_eq!(got.source, "warmup");
    assert_eq!(bus.metrics().subscriber_count, 0);
    bus.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wait_for_times_out_with_none() {
    let bus = running_bus().await;
    let got = bus
        .wait_for(EventKind::QuotaWarning, Duration::from_millis(100), None)
        .await;
    assert!(got.is_none());
    assert_eq!(bus.metrics().subscriber_count, 0);
    bus.stop().await;
}

#[tokio::test]
async fn filtered_subscription_sees_only_matching_events() {
    let bus = running_bus().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    bus.subscribe_filtered(
        EventKind::DataUpdate,
        "aapl_only",
        handler_fn(move |ev: Arc<Event>| {
            let s = Arc::clone(&s);
            async move {
                if let EventPayload::DataUpdate { symbol, .. } = &ev.payload {
                    s.lock().unwrap().push(symbol.clone());
                }
                Ok(())
            }
        }),
        filter_fn(|e: &Event| {
            matches!(&e.payload, EventPayload::DataUpdate { symbol, .. } if symbol.as_str() == AAPL)
        }),
    );
    bus.publish(Event::data_update("t", sym(MSFT), "quote", json!(1)));
    bus.publish(Event::data_update("t", sym(AAPL), "quote", json!(2)));
    bus.publish(Event::data_update("t", sym(MSFT), "quote", json!(3)));
    bus.stop().await;
    assert_eq!(*seen.lock().unwrap(), vec![sym(AAPL)]);
}

#[tokio::test]
async fn publish_with_priority_overrides_event_priority() {
    let bus = running_bus().await;
    let seen = record(&bus, EventKind::DataUpdate);
    bus.publish_with_priority(numbered(0), EventPriority::Critical);
    bus.stop().await;
    let ev = seen.lock().unwrap()[0].clone();
    assert_eq!(ev.priority, EventPriority::Critical);
}

#[tokio::test]
async fn unsubscribe_reports_whether_the_subscription_existed() {
    let bus = EventBus::default();
    let id = bus.subscribe(
        EventKind::RiskAlert,
        "tmp",
        handler_fn(|_ev: Arc<Event>| async { Ok(()) }),
    );
    let wild = bus.subscribe_all("wild", handler_fn(|_ev: Arc<Event>| async { Ok(()) }));
    assert_eq!(bus.metrics().subscriber_count, 2);

    assert!(!bus.unsubscribe(None, id));
    assert!(bus.unsubscribe(Some(EventKind::RiskAlert), id));
    assert!(!bus.unsubscribe(Some(EventKind::RiskAlert), id));
    assert!(bus.unsubscribe(None, wild));
    assert_eq!(bus.metrics().subscriber_count, 0);
}

#[tokio::test]
async fn start_is_idempotent() {
    let bus = running_bus().await;
    bus.start().await;
    let seen = record(&bus, EventKind::DataUpdate);
    bus.publish(numbered(0));
    bus.stop().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(bus.metrics().events_processed, 1);
}
