//! Configuration types shared across the bus, the ledger, the chain and the scheduler.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::market::HistoryRequest;
use crate::quota::QuotaPeriod;
use crate::scan::ScanKind;
use crate::GapwatchError;

/// Event bus sizing and shutdown behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum queued events; further publishes are dropped.
    pub capacity: usize,
    /// Upper bound on how long `stop()` waits for the queue to drain.
    pub drain_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl BusConfig {
    /// Drain timeout as a `Duration`.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Allowance for a single provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    /// Provider identifier, matching the provider's `name()`.
    pub provider: String,
    /// Units per period.
    pub limit: u64,
    /// Reset period.
    pub period: QuotaPeriod,
}

impl QuotaLimit {
    /// Build a limit entry.
    pub fn new(provider: impl Into<String>, limit: u64, period: QuotaPeriod) -> Self {
        Self {
            provider: provider.into(),
            limit,
            period,
        }
    }
}

/// Quota guard configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaGuardConfig {
    /// Per-provider allowances. Providers not listed are not tracked.
    pub providers: Vec<QuotaLimit>,
    /// JSON ledger file; `None` keeps the ledger in memory only.
    pub state_file: Option<PathBuf>,
    /// CSV usage audit log; `None` disables auditing.
    pub usage_log: Option<PathBuf>,
    /// Usage percent above which a warning is logged and published.
    pub warn_percent: f64,
    /// Usage percent above which a high-usage warning is logged.
    pub high_usage_percent: f64,
}

impl Default for QuotaGuardConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                QuotaLimit::new("finnhub", 60, QuotaPeriod::Minute),
                QuotaLimit::new("alpha_vantage", 25, QuotaPeriod::Day),
                QuotaLimit::new("newsapi", 1000, QuotaPeriod::Day),
            ],
            state_file: None,
            usage_log: None,
            warn_percent: 80.0,
            high_usage_percent: 90.0,
        }
    }
}

/// TTL cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for single quotes.
    pub quote_ttl_secs: u64,
    /// TTL for bar history.
    pub history_ttl_secs: u64,
    /// Maximum number of entries kept in memory.
    pub max_entries: usize,
    /// Optional JSON file persisting entries across restarts.
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            quote_ttl_secs: 60,
            history_ttl_secs: 3_600,
            max_entries: 10_000,
            path: None,
        }
    }
}

impl CacheConfig {
    /// Quote TTL as a `Duration`.
    #[must_use]
    pub const fn quote_ttl(&self) -> Duration {
        Duration::from_secs(self.quote_ttl_secs)
    }

    /// History TTL as a `Duration`.
    #[must_use]
    pub const fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }
}

/// Exponential backoff configuration for reconnecting the streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial reconnect delay in milliseconds.
    pub min_backoff_ms: u64,
    /// Maximum reconnect delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Exponential factor applied after each consecutive failure (>= 1).
    pub factor: u32,
    /// Random jitter percentage [0, 100] added on top of each delay, within `max_backoff_ms`.
    pub jitter_percent: u8,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 5_000,
            max_backoff_ms: 300_000,
            factor: 2,
            jitter_percent: 0,
        }
    }
}

/// Provider fallback chain configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Usage percent above which a provider is demoted below its peers.
    pub demotion_threshold_percent: f64,
    /// Timeout for individual provider calls.
    pub provider_timeout_ms: u64,
    /// Symbols per batched provider call in `get_many`.
    pub batch_size: usize,
    /// Streaming reconnect backoff.
    pub backoff: BackoffConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            demotion_threshold_percent: 95.0,
            provider_timeout_ms: 5_000,
            batch_size: 50,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Provider timeout as a `Duration`.
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

/// Workflow coordinator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Wall-clock deadline for one run.
    pub run_deadline_ms: u64,
    /// Maximum number of plans handed to the risk gate per run.
    pub max_plans: usize,
    /// Optional bar history fetched for every symbol before scanning.
    pub history: Option<HistoryRequest>,
    /// Number of finalized runs kept in memory.
    pub history_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            run_deadline_ms: 25_000,
            max_plans: 5,
            history: None,
            history_capacity: 32,
        }
    }
}

impl CoordinatorConfig {
    /// Run deadline as a `Duration`.
    #[must_use]
    pub const fn run_deadline(&self) -> Duration {
        Duration::from_millis(self.run_deadline_ms)
    }
}

/// One daily trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Kind of scan fired.
    pub kind: ScanKind,
    /// Local time of day, `HH:MM`.
    pub time: String,
    /// Whether the trigger fires.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

const fn enabled_by_default() -> bool {
    true
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// IANA timezone the trigger times are expressed in.
    pub timezone: String,
    /// Tick interval of the trigger loop.
    pub tick_interval_ms: u64,
    /// Daily triggers.
    pub triggers: Vec<TriggerConfig>,
    /// Optional JSON file recording last runs.
    pub state_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "Europe/Berlin".to_string(),
            tick_interval_ms: 30_000,
            triggers: vec![
                TriggerConfig {
                    kind: ScanKind::Primary,
                    time: "14:00".to_string(),
                    enabled: true,
                },
                TriggerConfig {
                    kind: ScanKind::SecondLook,
                    time: "18:15".to_string(),
                    enabled: true,
                },
            ],
            state_file: None,
        }
    }
}

impl SchedulerConfig {
    /// Parse the configured timezone.
    ///
    /// # Errors
    /// Returns `GapwatchError::Config` for unknown IANA names.
    pub fn tz(&self) -> Result<Tz, GapwatchError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| GapwatchError::Config(format!("timezone '{}': {e}", self.timezone)))
    }

    /// Tick interval as a `Duration`.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Check the timezone, the tick interval and every trigger time.
    ///
    /// # Errors
    /// Returns `GapwatchError::Config` describing the first violation found.
    pub fn validate(&self) -> Result<(), GapwatchError> {
        self.tz()?;
        if self.tick_interval_ms == 0 {
            return Err(GapwatchError::Config(
                "scheduler.tick_interval_ms must be > 0".into(),
            ));
        }
        for t in &self.triggers {
            parse_local_time(&t.time).map_err(|e| GapwatchError::Config(e.to_string()))?;
        }
        Ok(())
    }
}

/// Parse a local time of day written as `HH:MM`.
///
/// # Errors
/// Returns `GapwatchError::InvalidArg` for anything else.
pub fn parse_local_time(s: &str) -> Result<NaiveTime, GapwatchError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| GapwatchError::InvalidArg(format!("time '{s}' is not HH:MM: {e}")))
}

/// Top-level configuration for a gapwatch runtime.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GapwatchConfig {
    /// Event bus.
    pub bus: BusConfig,
    /// Quota guard.
    pub quota: QuotaGuardConfig,
    /// TTL cache.
    pub cache: CacheConfig,
    /// Provider fallback chain.
    pub chain: ChainConfig,
    /// Workflow coordinator.
    pub coordinator: CoordinatorConfig,
    /// Scheduler.
    pub scheduler: SchedulerConfig,
}

impl GapwatchConfig {
    /// Parse and validate a JSON document. Missing sections take defaults.
    ///
    /// # Errors
    /// Returns `GapwatchError::Config` on malformed JSON or failed validation.
    pub fn from_json_str(s: &str) -> Result<Self, GapwatchError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON configuration file.
    ///
    /// # Errors
    /// Returns `GapwatchError::Persistence` if the file cannot be read and
    /// `GapwatchError::Config` if it is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GapwatchError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| GapwatchError::persistence(path, e))?;
        Self::from_json_str(&raw)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns `GapwatchError::Config` describing the first violation found.
    pub fn validate(&self) -> Result<(), GapwatchError> {
        if self.bus.capacity == 0 {
            return Err(GapwatchError::Config("bus.capacity must be > 0".into()));
        }
        if self.bus.drain_timeout_ms == 0 {
            return Err(GapwatchError::Config("bus.drain_timeout_ms must be > 0".into()));
        }
        if self.coordinator.run_deadline_ms == 0 {
            return Err(GapwatchError::Config(
                "coordinator.run_deadline_ms must be > 0".into(),
            ));
        }
        for l in &self.quota.providers {
            if l.limit == 0 {
                return Err(GapwatchError::Config(format!(
                    "quota limit for '{}' must be > 0",
                    l.provider
                )));
            }
        }
        let pct_ok = |v: f64| v > 0.0 && v <= 100.0;
        if !pct_ok(self.quota.warn_percent) || !pct_ok(self.quota.high_usage_percent) {
            return Err(GapwatchError::Config(
                "quota thresholds must be within (0, 100]".into(),
            ));
        }
        if !pct_ok(self.chain.demotion_threshold_percent) {
            return Err(GapwatchError::Config(
                "chain.demotion_threshold_percent must be within (0, 100]".into(),
            ));
        }
        let b = &self.chain.backoff;
        if b.factor == 0 {
            return Err(GapwatchError::Config("backoff.factor must be >= 1".into()));
        }
        if b.min_backoff_ms > b.max_backoff_ms {
            return Err(GapwatchError::Config(
                "backoff.min_backoff_ms must not exceed max_backoff_ms".into(),
            ));
        }
        if b.jitter_percent > 100 {
            return Err(GapwatchError::Config("backoff.jitter_percent must be <= 100".into()));
        }
        if self.chain.batch_size == 0 {
            return Err(GapwatchError::Config("chain.batch_size must be > 0".into()));
        }
        self.scheduler.validate()
    }
}
