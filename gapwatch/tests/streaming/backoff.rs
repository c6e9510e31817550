use gapwatch::chain::streaming::backoff::{ReconnectBackoff, jitter_wait};
use gapwatch_core::BackoffConfig;
use proptest::prelude::*;

#[test]
fn jitter_wait_within_bounds() {
    let base_ms = 1000;
    let jitter_percent = 10;
    for _ in 0..100 {
        let v = jitter_wait(base_ms, jitter_percent, u64::MAX);
        assert!(v >= base_ms);
        assert!(v < base_ms + (base_ms * u64::from(jitter_percent)) / 100 + 1);
    }
}

#[test]
fn jitter_wait_zero_percent_is_identity() {
    for _ in 0..10 {
        assert_eq!(jitter_wait(500, 0, u64::MAX), 500);
    }
}

#[test]
fn jitter_wait_on_zero_base_stays_zero() {
    assert_eq!(jitter_wait(0, 50, u64::MAX), 0);
}

#[test]
fn delays_double_up_to_the_cap() {
    let mut b = ReconnectBackoff::new(&BackoffConfig {
        min_backoff_ms: 5_000,
        max_backoff_ms: 60_000,
        factor: 2,
        jitter_percent: 0,
    });
    let seq: Vec<u64> = (0..6).map(|_| b.next_delay()).collect();
    assert_eq!(seq, vec![5_000, 10_000, 20_000, 40_000, 60_000, 60_000]);
    assert_eq!(b.peek(), 60_000);
    b.reset();
    assert_eq!(b.next_delay(), 5_000);
}

#[test]
fn degenerate_config_is_clamped() {
    let mut b = ReconnectBackoff::new(&BackoffConfig {
        min_backoff_ms: 10_000,
        max_backoff_ms: 1_000,
        factor: 0,
        jitter_percent: 0,
    });
    assert_eq!(b.next_delay(), 1_000);
    assert_eq!(b.next_delay(), 1_000);
}

#[test]
fn jitter_never_pushes_a_capped_delay_past_the_cap() {
    let cfg = BackoffConfig {
        min_backoff_ms: 1_000,
        max_backoff_ms: 4_000,
        factor: 2,
        jitter_percent: 50,
    };
    let mut b = ReconnectBackoff::new(&cfg);
    for _ in 0..200 {
        let wait = jitter_wait(b.next_delay(), 50, b.cap());
        assert!(wait <= 4_000, "wait {wait} exceeded cap");
    }
}

proptest! {
    #[test]
    fn jittered_waits_stay_within_the_configured_cap(
        min_ms in 0u64..10_000,
        max_ms in 1u64..120_000,
        factor in 0u32..8,
        jitter in 0u8..=100,
        failures in 1usize..20,
    ) {
        let cfg = BackoffConfig {
            min_backoff_ms: min_ms,
            max_backoff_ms: max_ms,
            factor,
            jitter_percent: jitter,
        };
        let mut b = ReconnectBackoff::new(&cfg);
        for _ in 0..failures {
            let wait = jitter_wait(b.next_delay(), u32::from(jitter), b.cap());
            prop_assert!(wait <= max_ms);
        }
    }
}
