//! Local-time trigger arithmetic.
//!
//! Firing times are always rebuilt from the local date and time of day, so a
//! daily trigger keeps its wall-clock time across DST transitions.

use chrono::offset::LocalResult;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use gapwatch_core::ScanKind;
use serde::{Deserialize, Serialize};

/// One daily trigger and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Scan fired by this trigger.
    pub kind: ScanKind,
    /// Local time of day.
    pub time: NaiveTime,
    /// Disabled triggers keep their table entry but never fire.
    pub enabled: bool,
    /// Last firing.
    pub last_run: Option<DateTime<Utc>>,
    /// Next firing; `None` while disabled.
    pub next_run: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    pub(crate) fn new(kind: ScanKind, time: NaiveTime, enabled: bool) -> Self {
        Self {
            kind,
            time,
            enabled,
            last_run: None,
            next_run: None,
        }
    }

    /// Recompute `next_run` relative to `now`.
    pub(crate) fn reschedule(&mut self, now: DateTime<Utc>, tz: Tz) {
        self.next_run = self.enabled.then(|| next_run_after(now, self.time, tz));
    }

    /// Whether the trigger is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|t| t <= now)
    }
}

/// The instant `date` at `time` maps to in `tz`.
///
/// An ambiguous local time resolves to its earlier instant. A local time
/// inside a gap resolves to the first valid minute after the gap.
#[must_use]
pub fn resolve_local(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    let mut naive = date.and_time(time);
    for _ in 0..=24 * 60 {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => return Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(a, b) => return Some(a.min(b).with_timezone(&Utc)),
            LocalResult::None => {
                naive = naive.checked_add_signed(TimeDelta::minutes(1))?;
            }
        }
    }
    None
}

/// First instant strictly after `now` at which local time in `tz` reads `time`.
#[must_use]
pub fn next_run_after(now: DateTime<Utc>, time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    today
        .iter_days()
        .take(3)
        .filter_map(|d| resolve_local(d, time, tz))
        .find(|t| *t > now)
        .unwrap_or(now + TimeDelta::days(1))
}
