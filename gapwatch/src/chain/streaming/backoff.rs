use gapwatch_core::BackoffConfig;
use rand::Rng;

/// Add up to `jitter_percent` of `base_ms` as random jitter, never waiting
/// longer than `cap_ms`.
#[must_use]
pub fn jitter_wait(base_ms: u64, jitter_percent: u32, cap_ms: u64) -> u64 {
    let jitter_range = if jitter_percent == 0 {
        1
    } else {
        std::cmp::max(1, base_ms.saturating_mul(u64::from(jitter_percent)) / 100)
    };
    let mut rng = rand::rng();
    base_ms
        .saturating_add(rng.random_range(0..jitter_range))
        .min(cap_ms)
}

/// Reconnect delay that grows geometrically up to a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    current_ms: u64,
    min_ms: u64,
    max_ms: u64,
    factor: u32,
}

impl ReconnectBackoff {
    /// Start at the configured minimum.
    #[must_use]
    pub fn new(cfg: &BackoffConfig) -> Self {
        let min_ms = cfg.min_backoff_ms.min(cfg.max_backoff_ms);
        Self {
            current_ms: min_ms,
            min_ms,
            max_ms: cfg.max_backoff_ms,
            factor: cfg.factor.max(1),
        }
    }

    /// Delay to wait now; the following one is `factor` times longer, capped.
    pub fn next_delay(&mut self) -> u64 {
        let d = self.current_ms;
        self.current_ms = self
            .current_ms
            .saturating_mul(u64::from(self.factor))
            .min(self.max_ms);
        d
    }

    /// Delay the next failure will wait.
    #[must_use]
    pub const fn peek(&self) -> u64 {
        self.current_ms
    }

    /// Upper bound on any wait, jitter included.
    #[must_use]
    pub const fn cap(&self) -> u64 {
        self.max_ms
    }

    /// Back to the minimum.
    pub const fn reset(&mut self) {
        self.current_ms = self.min_ms;
    }
}
