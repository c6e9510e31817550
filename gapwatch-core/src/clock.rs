use chrono::{DateTime, Utc};

/// Source of wall-clock time.
///
/// Timers still use `tokio::time`; this only decides what "now" means for
/// ledger resets, cache expiry and trigger times.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current UTC instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
