//! Per-provider quota ledger with lazy elapsed-time resets, durable state and
//! an optional usage audit log.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use gapwatch_core::{
    Clock, GapwatchError, QuotaGuardConfig, QuotaLedgerEntry, QuotaPeriod, QuotaSnapshot,
    SystemClock, UsageLogRecord,
};
use serde::{Deserialize, Serialize};

use crate::snapshot::SnapshotFile;
use crate::usage_log::{UsageLog, UsageSummary};

/// Callback invoked when a provider's quota is exhausted.
pub type FallbackCallback = Arc<dyn Fn(QuotaSnapshot) -> BoxFuture<'static, ()> + Send + Sync>;

const EXHAUSTED_MESSAGE: &str = "Quota exhausted";

/// On-disk form of one ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedEntry {
    used: u64,
    limit: u64,
    period: QuotaPeriod,
    last_reset: DateTime<Utc>,
    last_call: Option<DateTime<Utc>>,
}

impl From<&QuotaLedgerEntry> for PersistedEntry {
    fn from(e: &QuotaLedgerEntry) -> Self {
        Self {
            used: e.used,
            limit: e.limit,
            period: e.period,
            last_reset: e.last_reset,
            last_call: e.last_call,
        }
    }
}

/// In-memory image of the ledger file. `revisions` records the revision of
/// the entry last accepted per provider; older copies are ignored.
struct StoreState {
    entries: BTreeMap<String, PersistedEntry>,
    revisions: HashMap<String, u64>,
}

/// JSON ledger file holding every provider's entry.
struct LedgerStore {
    file: SnapshotFile,
    state: Mutex<StoreState>,
}

impl LedgerStore {
    fn open(path: &Path) -> Result<Self, GapwatchError> {
        let entries = match std::fs::read_to_string(path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| GapwatchError::persistence(path, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(GapwatchError::persistence(path, e)),
        };
        Ok(Self {
            file: SnapshotFile::new(path.to_path_buf()),
            state: Mutex::new(StoreState {
                entries,
                revisions: HashMap::new(),
            }),
        })
    }

    fn get(&self, provider: &str) -> Option<PersistedEntry> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(provider)
            .cloned()
    }

    /// Record revisioned entries and rewrite the file. Only the map lock is
    /// held while serializing; the disk write happens after it is released.
    fn save(&self, entries: &[(u64, QuotaLedgerEntry)]) -> Result<(), GapwatchError> {
        let (seq, body) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            for (revision, entry) in entries {
                let seen = state.revisions.get(&entry.provider).copied().unwrap_or(0);
                if *revision <= seen {
                    continue;
                }
                state.revisions.insert(entry.provider.clone(), *revision);
                state
                    .entries
                    .insert(entry.provider.clone(), PersistedEntry::from(entry));
            }
            let body = serde_json::to_vec_pretty(&state.entries)
                .map_err(|e| GapwatchError::persistence(self.file.path(), e))?;
            (self.file.stamp(), body)
        };
        self.file.write(seq, &body).map(|_| ())
    }
}

/// Rate-limit ledger shared by every caller of rate-limited providers.
///
/// Each provider's entry sits behind its own mutex; consumption is a single
/// check-then-increment under that lock. Providers without a configured
/// limit are not tracked: checks pass and consumption is a no-op.
pub struct QuotaGuard {
    ledgers: HashMap<String, Mutex<QuotaLedgerEntry>>,
    fallbacks: RwLock<HashMap<String, FallbackCallback>>,
    store: Option<LedgerStore>,
    usage_log: Option<UsageLog>,
    clock: Arc<dyn Clock>,
    warn_percent: f64,
    high_usage_percent: f64,
    persist_failures: AtomicU64,
    revisions: AtomicU64,
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("providers", &self.ledgers.keys().collect::<Vec<_>>())
            .field("persistent", &self.store.is_some())
            .field("audited", &self.usage_log.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`QuotaGuard`].
pub struct QuotaGuardBuilder {
    limits: Vec<(String, u64, QuotaPeriod)>,
    state_file: Option<PathBuf>,
    usage_log: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    warn_percent: f64,
    high_usage_percent: f64,
}

impl Default for QuotaGuardBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaGuardBuilder {
    /// Empty builder: no providers, in-memory only, system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            limits: Vec::new(),
            state_file: None,
            usage_log: None,
            clock: Arc::new(SystemClock),
            warn_percent: 80.0,
            high_usage_percent: 90.0,
        }
    }

    /// Builder seeded from configuration.
    #[must_use]
    pub fn from_config(cfg: &QuotaGuardConfig) -> Self {
        let mut b = Self::new();
        for l in &cfg.providers {
            b = b.provider(l.provider.clone(), l.limit, l.period);
        }
        b.state_file = cfg.state_file.clone();
        b.usage_log = cfg.usage_log.clone();
        b.warn_percent = cfg.warn_percent;
        b.high_usage_percent = cfg.high_usage_percent;
        b
    }

    /// Track `provider` with `limit` units per `period`. Re-adding replaces the limit.
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>, limit: u64, period: QuotaPeriod) -> Self {
        let provider = provider.into();
        self.limits.retain(|(p, _, _)| *p != provider);
        self.limits.push((provider, limit, period));
        self
    }

    /// Persist the ledger to a JSON file and restore it on build.
    #[must_use]
    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Append every consumption attempt to a CSV audit log.
    #[must_use]
    pub fn usage_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.usage_log = Some(path.into());
        self
    }

    /// Use a custom clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Usage percent above which consumption logs a warning.
    #[must_use]
    pub const fn warn_percent(mut self, pct: f64) -> Self {
        self.warn_percent = pct;
        self
    }

    /// Build the guard, restoring persisted counters and applying lazy resets.
    ///
    /// # Errors
    /// Returns `GapwatchError::Persistence` if the state file or usage log cannot be opened.
    pub fn build(self) -> Result<QuotaGuard, GapwatchError> {
        let now = self.clock.now();
        let store = self.state_file.as_deref().map(LedgerStore::open).transpose()?;
        let usage_log = self.usage_log.as_deref().map(UsageLog::open).transpose()?;

        let mut ledgers = HashMap::with_capacity(self.limits.len());
        for (provider, limit, period) in self.limits {
            let mut entry = QuotaLedgerEntry::new(provider.clone(), limit, period, now);
            if let Some(saved) = store.as_ref().and_then(|s| s.get(&provider)) {
                entry.used = saved.used;
                entry.last_reset = saved.last_reset;
                entry.last_call = saved.last_call;
                if saved.period != period {
                    entry.reset(now);
                } else if entry.used > limit {
                    tracing::info!(
                        provider = %provider,
                        saved_used = entry.used,
                        limit,
                        "restored usage exceeds the configured limit; clamping"
                    );
                    entry.used = limit;
                }
            }
            if entry.reset_if_elapsed(now) {
                tracing::debug!(provider = %provider, "quota window elapsed while offline; reset");
            }
            tracing::debug!(provider = %provider, used = entry.used, limit, period = %period, "quota ledger ready");
            ledgers.insert(provider, Mutex::new(entry));
        }

        Ok(QuotaGuard {
            ledgers,
            fallbacks: RwLock::new(HashMap::new()),
            store,
            usage_log,
            clock: self.clock,
            warn_percent: self.warn_percent,
            high_usage_percent: self.high_usage_percent,
            persist_failures: AtomicU64::new(0),
            revisions: AtomicU64::new(0),
        })
    }
}

impl QuotaGuard {
    /// Start building a guard.
    #[must_use]
    pub fn builder() -> QuotaGuardBuilder {
        QuotaGuardBuilder::new()
    }

    /// Build directly from configuration with the given clock.
    ///
    /// # Errors
    /// See [`QuotaGuardBuilder::build`].
    pub fn from_config(cfg: &QuotaGuardConfig, clock: Arc<dyn Clock>) -> Result<Self, GapwatchError> {
        QuotaGuardBuilder::from_config(cfg).clock(clock).build()
    }

    /// Whether `provider` has a configured limit.
    #[must_use]
    pub fn is_tracked(&self, provider: &str) -> bool {
        self.ledgers.contains_key(provider)
    }

    fn with_entry<R>(
        &self,
        provider: &str,
        f: impl FnOnce(&mut QuotaLedgerEntry, DateTime<Utc>) -> R,
    ) -> Option<R> {
        let slot = self.ledgers.get(provider)?;
        let now = self.clock.now();
        let mut entry = slot.lock().unwrap_or_else(PoisonError::into_inner);
        entry.reset_if_elapsed(now);
        Some(f(&mut entry, now))
    }

    /// Read-only check that `count` units fit in `provider`'s current window.
    ///
    /// Untracked providers always pass.
    #[must_use]
    pub fn check_quota(&self, provider: &str, count: u64) -> bool {
        self.with_entry(provider, |e, _| e.remaining() >= count)
            .unwrap_or(true)
    }

    /// True only if every `(provider, count)` pair fits. Does not consume.
    pub fn check_multi_quota<I, K>(&self, requests: I) -> bool
    where
        I: IntoIterator<Item = (K, u64)>,
        K: AsRef<str>,
    {
        requests
            .into_iter()
            .all(|(p, n)| self.check_quota(p.as_ref(), n))
    }

    /// Consume `count` units for `endpoint` on `provider`.
    ///
    /// Returns the post-consumption snapshot, or `None` for untracked providers.
    ///
    /// # Errors
    /// Returns `GapwatchError::QuotaExhausted` when the window lacks room; the
    /// ledger is left unchanged, a failed row is logged and the provider's
    /// fallback callback (if any) runs before the error is returned.
    #[tracing::instrument(name = "gapwatch::quota::consume", skip(self))]
    pub async fn consume_quota(
        &self,
        provider: &str,
        count: u64,
        endpoint: &str,
    ) -> Result<Option<QuotaSnapshot>, GapwatchError> {
        let outcome = self.with_entry(provider, |entry, now| {
            let before = entry.used;
            if entry.remaining() < count {
                let row = self.usage_row(entry, now, endpoint, count, before, false);
                return Err((entry.snapshot(), row));
            }
            entry.used += count;
            entry.last_call = Some(now);
            let row = self.usage_row(entry, now, endpoint, count, before, true);
            Ok((entry.snapshot(), (self.next_revision(), entry.clone()), row))
        });

        match outcome {
            None => {
                tracing::trace!(provider, "untracked provider; quota not enforced");
                Ok(None)
            }
            Some(Ok((snapshot, entry, row))) => {
                self.append_usage(row);
                self.persist(std::slice::from_ref(&entry));
                if snapshot.usage_percent > self.high_usage_percent {
                    tracing::warn!(provider, usage_percent = snapshot.usage_percent, remaining = snapshot.remaining, "high quota usage");
                } else if snapshot.usage_percent > self.warn_percent {
                    tracing::warn!(provider, usage_percent = snapshot.usage_percent, remaining = snapshot.remaining, "quota warning threshold crossed");
                }
                Ok(Some(snapshot))
            }
            Some(Err((snapshot, row))) => {
                self.append_usage(row);
                tracing::warn!(provider, used = snapshot.used, limit = snapshot.limit, resets_at = %snapshot.resets_at, "quota exhausted");
                let callback = self
                    .fallbacks
                    .read()
                    .ok()
                    .and_then(|m| m.get(provider).cloned());
                if let Some(cb) = callback {
                    cb(snapshot.clone()).await;
                }
                Err(GapwatchError::quota_exhausted(snapshot))
            }
        }
    }

    fn usage_row(
        &self,
        entry: &QuotaLedgerEntry,
        now: DateTime<Utc>,
        endpoint: &str,
        count: u64,
        before: u64,
        success: bool,
    ) -> Option<UsageLogRecord> {
        self.usage_log.as_ref()?;
        Some(UsageLogRecord {
            timestamp: now,
            provider: entry.provider.clone(),
            endpoint: endpoint.to_string(),
            count,
            usage_before: before,
            usage_after: entry.used,
            limit: entry.limit,
            percentage: entry.usage_percent(),
            period: entry.period,
            success,
            error_message: (!success).then(|| EXHAUSTED_MESSAGE.to_string()),
        })
    }

    fn append_usage(&self, row: Option<UsageLogRecord>) {
        let (Some(log), Some(record)) = (self.usage_log.as_ref(), row) else {
            return;
        };
        if let Err(e) = log.append(&record) {
            tracing::error!(error = %e, "failed to append usage log row");
        }
    }

    /// Revision for an entry copied under its provider lock.
    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Write entries copied out of their provider locks.
    fn persist(&self, entries: &[(u64, QuotaLedgerEntry)]) {
        if let Some(store) = self.store.as_ref()
            && let Err(e) = store.save(entries)
        {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "failed to persist quota ledger");
        }
    }

    fn copy_entries(&self) -> Vec<(u64, QuotaLedgerEntry)> {
        self.ledgers
            .values()
            .map(|slot| {
                let entry = slot.lock().unwrap_or_else(PoisonError::into_inner);
                (self.next_revision(), entry.clone())
            })
            .collect()
    }

    /// Register an async callback run whenever `provider` is found exhausted.
    pub fn register_fallback<F>(&self, provider: impl Into<String>, callback: F)
    where
        F: Fn(QuotaSnapshot) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        if let Ok(mut m) = self.fallbacks.write() {
            m.insert(provider.into(), Arc::new(callback));
        }
    }

    /// Snapshot of one provider, after applying a lazy reset.
    #[must_use]
    pub fn snapshot(&self, provider: &str) -> Option<QuotaSnapshot> {
        self.with_entry(provider, |e, _| e.snapshot())
    }

    /// Remaining units for `provider`; `None` when untracked.
    #[must_use]
    pub fn remaining(&self, provider: &str) -> Option<u64> {
        self.with_entry(provider, |e, _| e.remaining())
    }

    /// Usage percent for `provider`; `None` when untracked.
    #[must_use]
    pub fn usage_percent(&self, provider: &str) -> Option<f64> {
        self.with_entry(provider, |e, _| e.usage_percent())
    }

    /// Snapshots of all tracked providers.
    #[must_use]
    pub fn status(&self) -> BTreeMap<String, QuotaSnapshot> {
        self.ledgers
            .keys()
            .filter_map(|p| self.snapshot(p).map(|s| (p.clone(), s)))
            .collect()
    }

    /// Providers whose usage is above the warning threshold.
    #[must_use]
    pub fn warnings(&self) -> Vec<QuotaSnapshot> {
        self.status()
            .into_values()
            .filter(|s| s.usage_percent > self.warn_percent)
            .collect()
    }

    /// Warning threshold in percent.
    #[must_use]
    pub const fn warn_percent(&self) -> f64 {
        self.warn_percent
    }

    /// Start a fresh window for every provider and persist.
    pub fn reset_all(&self) {
        let now = self.clock.now();
        for (provider, slot) in &self.ledgers {
            slot.lock().unwrap_or_else(PoisonError::into_inner).reset(now);
            tracing::info!(provider = %provider, "quota reset");
        }
        self.persist(&self.copy_entries());
    }

    /// Write every ledger entry to the state file.
    ///
    /// # Errors
    /// Returns `GapwatchError::Persistence` on the first write failure.
    pub fn flush(&self) -> Result<(), GapwatchError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        store.save(&self.copy_entries())
    }

    /// Number of ledger writes that failed since construction.
    #[must_use]
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    /// The attached usage log, if any.
    #[must_use]
    pub const fn usage_log(&self) -> Option<&UsageLog> {
        self.usage_log.as_ref()
    }

    /// Aggregate the usage log over the last `days` days.
    ///
    /// # Errors
    /// Returns `GapwatchError::InvalidArg` when no usage log is attached, or
    /// read failures from the log.
    pub fn usage_summary(&self, days: u32) -> Result<UsageSummary, GapwatchError> {
        let log = self
            .usage_log
            .as_ref()
            .ok_or_else(|| GapwatchError::InvalidArg("no usage log configured".into()))?;
        log.summary(days, self.clock.now())
    }

    /// Export the daily summary for `date` into `dir`.
    ///
    /// # Errors
    /// Returns `GapwatchError::InvalidArg` when no usage log is attached, or
    /// persistence failures from the export.
    pub fn export_daily_summary(
        &self,
        date: NaiveDate,
        dir: impl AsRef<Path>,
    ) -> Result<PathBuf, GapwatchError> {
        let log = self
            .usage_log
            .as_ref()
            .ok_or_else(|| GapwatchError::InvalidArg("no usage log configured".into()))?;
        log.export_daily_summary(date, dir)
    }
}
