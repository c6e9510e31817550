use std::sync::Arc;

use gapwatch::chain::streaming::supervisor_sm::{Action, Event, Phase, Supervisor};
use gapwatch_core::{BackoffConfig, ConnectionState, GapwatchError, Symbol};
use proptest::prelude::*;

use crate::helpers::{AAPL, MSFT, syms};

fn cfg() -> BackoffConfig {
    BackoffConfig {
        min_backoff_ms: 5_000,
        max_backoff_ms: 40_000,
        factor: 2,
        jitter_percent: 0,
    }
}

fn set(list: &[&str]) -> Arc<[Symbol]> {
    syms(list).into()
}

fn connecting(list: &[&str]) -> Supervisor {
    let (sup, _) = Supervisor::new(&cfg()).handle(Event::SymbolsChanged(set(list)));
    sup
}

fn connected(list: &[&str]) -> Supervisor {
    let (sup, _) = connecting(list).handle(Event::ConnectSucceeded);
    sup
}

fn disconnect() -> Event {
    Event::ConnectFailed(GapwatchError::stream_disconnect("ws", "refused"))
}

fn scheduled_delay(actions: &[Action]) -> Option<u64> {
    actions.iter().find_map(|a| match a {
        Action::ScheduleReconnect { delay_ms } => Some(*delay_ms),
        _ => None,
    })
}

#[test]
fn first_symbols_open_a_session() {
    let (sup, actions) = Supervisor::new(&cfg()).handle(Event::SymbolsChanged(set(&[AAPL])));
    assert_eq!(sup.phase, Phase::Connecting);
    assert_eq!(
        actions,
        vec![
            Action::Connect { symbols: set(&[AAPL]) },
            Action::Publish(ConnectionState::Connecting),
        ]
    );
}

#[test]
fn empty_symbol_set_goes_idle() {
    let (sup, actions) = connected(&[AAPL]).handle(Event::SymbolsChanged(set(&[])));
    assert_eq!(sup.phase, Phase::Idle);
    assert!(actions.contains(&Action::StopSession));
    assert!(actions.contains(&Action::Publish(ConnectionState::Idle)));
    assert!(scheduled_delay(&actions).is_none());
}

#[test]
fn connect_failure_schedules_growing_backoff() {
    let mut sup = connecting(&[AAPL]);
    let mut delays = Vec::new();
    for _ in 0..5 {
        let (next, actions) = sup.handle(disconnect());
        assert_eq!(next.phase, Phase::Backoff);
        assert!(actions.contains(&Action::Publish(ConnectionState::Backoff)));
        delays.push(scheduled_delay(&actions).unwrap());
        let (next, actions) = next.handle(Event::BackoffElapsed);
        assert!(matches!(actions[0], Action::Connect { .. }));
        sup = next;
    }
    assert_eq!(delays, vec![5_000, 10_000, 20_000, 40_000, 40_000]);
    assert_eq!(sup.consecutive_failures, 5);
}

#[test]
fn first_message_resets_the_backoff() {
    let mut sup = connecting(&[AAPL]);
    for _ in 0..3 {
        let (next, _) = sup.handle(disconnect());
        let (next, _) = next.handle(Event::BackoffElapsed);
        sup = next;
    }
    let (sup, _) = sup.handle(Event::ConnectSucceeded);
    assert_eq!(sup.phase, Phase::Connected { received: false });
    assert_eq!(sup.backoff.peek(), 40_000);

    let (sup, actions) = sup.handle(Event::MessageReceived);
    assert!(actions.is_empty());
    assert_eq!(sup.phase, Phase::Connected { received: true });
    assert_eq!(sup.consecutive_failures, 0);

    let (_, actions) = sup.handle(Event::SessionEnded);
    assert_eq!(scheduled_delay(&actions), Some(5_000));
}

#[test]
fn session_without_messages_keeps_escalating() {
    let (sup, _) = connecting(&[AAPL]).handle(disconnect());
    let (sup, _) = sup.handle(Event::BackoffElapsed);
    let (sup, _) = sup.handle(Event::ConnectSucceeded);
    let (_, actions) = sup.handle(Event::SessionEnded);
    assert_eq!(scheduled_delay(&actions), Some(10_000));
}

#[test]
fn symbol_change_while_connected_restarts_without_penalty() {
    let sup = connected(&[AAPL]);
    let (sup, actions) = sup.handle(Event::SymbolsChanged(set(&[AAPL, MSFT])));
    assert_eq!(sup.phase, Phase::Connecting);
    assert_eq!(
        actions,
        vec![
            Action::StopSession,
            Action::Connect { symbols: set(&[AAPL, MSFT]) },
            Action::Publish(ConnectionState::Connecting),
        ]
    );
    assert_eq!(sup.consecutive_failures, 0);
    assert_eq!(sup.backoff.peek(), 5_000);
}

#[test]
fn symbol_change_during_backoff_waits_for_the_timer() {
    let (sup, _) = connecting(&[AAPL]).handle(disconnect());
    let (sup, actions) = sup.handle(Event::SymbolsChanged(set(&[MSFT])));
    assert!(actions.is_empty());
    assert_eq!(sup.phase, Phase::Backoff);

    let (sup, actions) = sup.handle(Event::BackoffElapsed);
    assert_eq!(sup.phase, Phase::Connecting);
    assert_eq!(actions[0], Action::Connect { symbols: set(&[MSFT]) });
}

#[test]
fn stale_signals_are_ignored() {
    let sup = connected(&[AAPL]);
    let (sup, actions) = sup.handle(Event::BackoffElapsed);
    assert!(actions.is_empty());
    let (sup, actions) = sup.handle(Event::ConnectSucceeded);
    assert!(actions.is_empty());
    assert_eq!(sup.phase, Phase::Connected { received: false });
}

#[test]
fn shutdown_is_terminal() {
    let (sup, actions) = connected(&[AAPL]).handle(Event::Shutdown);
    assert_eq!(sup.phase, Phase::Stopped);
    assert_eq!(sup.state(), ConnectionState::Stopped);
    assert!(actions.contains(&Action::StopSession));
    assert!(actions.contains(&Action::CancelReconnect));

    let (sup, actions) = sup.handle(Event::SymbolsChanged(set(&[MSFT])));
    assert!(actions.is_empty());
    assert_eq!(sup.phase, Phase::Stopped);
}

#[derive(Debug, Clone)]
enum Step {
    Fail,
    Elapse,
    Succeed,
    Message,
    End,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => Just(Step::Fail),
        4 => Just(Step::Elapse),
        2 => Just(Step::Succeed),
        1 => Just(Step::Message),
        2 => Just(Step::End),
    ]
}

proptest! {
    #[test]
    fn scheduled_delays_stay_within_bounds(steps in prop::collection::vec(step(), 1..80)) {
        let c = cfg();
        let mut sup = connecting(&[AAPL]);
        let mut last: Option<u64> = None;
        for s in steps {
            let event = match s {
                Step::Fail => disconnect(),
                Step::Elapse => Event::BackoffElapsed,
                Step::Succeed => Event::ConnectSucceeded,
                Step::Message => Event::MessageReceived,
                Step::End => Event::SessionEnded,
            };
            let reset = matches!(sup.phase, Phase::Connected { received: false })
                && matches!(event, Event::MessageReceived);
            let (next, actions) = sup.handle(event);
            if reset {
                last = None;
            }
            if let Some(d) = scheduled_delay(&actions) {
                prop_assert!(d >= c.min_backoff_ms && d <= c.max_backoff_ms);
                if let Some(prev) = last {
                    prop_assert!(d >= prev, "delay shrank from {prev} to {d} without a message");
                }
                last = Some(d);
            }
            prop_assert!(next.phase != Phase::Idle);
            sup = next;
        }
    }
}
