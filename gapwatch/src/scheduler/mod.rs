//! Fires scans at configured local times and keeps the quote stream alive.

pub mod trigger;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use gapwatch_core::{
    Clock, ConnectionState, Event, EventPriority, GapwatchError, ScanKind, SchedulerConfig,
    parse_local_time,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::chain::ProviderFallbackChain;
pub use trigger::{ScheduledTask, next_run_after, resolve_local};

const COMPONENT: &str = "scheduler";

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    /// Whether the tick loop is running.
    pub running: bool,
    /// Timezone trigger times are read in.
    pub timezone: String,
    /// Streaming connection state, when a chain is attached.
    pub connection: Option<ConnectionState>,
    /// Every trigger, enabled or not.
    pub tasks: Vec<ScheduledTask>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedTask {
    last_run: Option<DateTime<Utc>>,
}

struct Workers {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

struct Inner {
    bus: EventBus,
    chain: Option<Arc<ProviderFallbackChain>>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    tick_interval: Duration,
    state_file: Option<PathBuf>,
    tasks: Mutex<BTreeMap<ScanKind, ScheduledTask>>,
    workers: tokio::sync::Mutex<Option<Workers>>,
}

impl Inner {
    fn lock_tasks(&self) -> MutexGuard<'_, BTreeMap<ScanKind, ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("timezone", &self.inner.tz)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Build from configuration. `chain`, when given, has its stream
    /// supervised for the scheduler's lifetime.
    ///
    /// # Errors
    /// Returns `Config` for an unknown timezone, a zero tick interval or a
    /// malformed trigger time.
    pub fn new(
        cfg: &SchedulerConfig,
        bus: EventBus,
        chain: Option<Arc<ProviderFallbackChain>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GapwatchError> {
        cfg.validate()?;
        let tz = cfg.tz()?;
        let now = clock.now();
        let mut tasks = BTreeMap::new();
        for t in &cfg.triggers {
            let time = parse_local_time(&t.time).map_err(|e| GapwatchError::Config(e.to_string()))?;
            let mut task = ScheduledTask::new(t.kind, time, t.enabled);
            task.reschedule(now, tz);
            tasks.insert(t.kind, task);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                bus,
                chain,
                clock,
                tz,
                tick_interval: cfg.tick_interval(),
                state_file: cfg.state_file.clone(),
                tasks: Mutex::new(tasks),
                workers: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Restore saved state, start the tick loop and the stream supervisor.
    /// Calling it on a running scheduler is a no-op.
    pub async fn start(&self) {
        let mut workers = self.inner.workers.lock().await;
        if workers.is_some() {
            return;
        }
        if let Some(path) = self.inner.state_file.as_deref() {
            match load_state(path) {
                Ok(saved) => self.restore(&saved),
                Err(e) => tracing::warn!(error = %e, "ignoring unreadable scheduler state"),
            }
        }
        let now = self.inner.clock.now();
        for task in self.inner.lock_tasks().values_mut() {
            task.reschedule(now, self.inner.tz);
            if let Some(next) = task.next_run {
                tracing::info!(kind = %task.kind, next_run = %next.with_timezone(&self.inner.tz), "trigger armed");
            }
        }

        let cancel = CancellationToken::new();
        let mut joins = vec![tokio::spawn(tick_loop(Arc::clone(&self.inner), cancel.clone()))];
        let mut streaming = false;
        if let Some(chain) = self.inner.chain.as_ref() {
            streaming = chain.start_streaming().await.is_some();
            joins.push(tokio::spawn(watch_connection(
                Arc::clone(chain),
                self.inner.bus.clone(),
                cancel.clone(),
            )));
        }
        *workers = Some(Workers { cancel, joins });

        let mut metrics = BTreeMap::new();
        metrics.insert("scheduled_scans".to_string(), self.inner.lock_tasks().len().into());
        metrics.insert("streaming".to_string(), streaming.into());
        self.inner.bus.publish(Event::system_status_with_metrics(
            COMPONENT,
            "started",
            "scheduler started",
            metrics,
        ));
        tracing::info!("scheduler started");
    }

    /// Stop the loops and the stream, then save state.
    pub async fn stop(&self) {
        let workers = self.inner.workers.lock().await.take();
        let Some(workers) = workers else {
            return;
        };
        workers.cancel.cancel();
        for j in workers.joins {
            if let Err(e) = j.await {
                tracing::error!(error = %e, "scheduler task failed");
            }
        }
        if let Some(chain) = self.inner.chain.as_ref() {
            chain.stop_streaming().await;
        }
        self.save();
        self.inner
            .bus
            .publish(Event::system_status(COMPONENT, "stopped", "scheduler stopped"));
        tracing::info!("scheduler stopped");
    }

    /// Fire every trigger due at `now` and return the kinds fired.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Vec<ScanKind> {
        tick(&self.inner, now)
    }

    /// Publish a high-priority scan request immediately, outside the schedule.
    ///
    /// Returns whether the bus accepted it.
    pub fn trigger_manual(&self, kind: ScanKind) -> bool {
        tracing::info!(kind = %kind, "manual scan requested");
        let accepted = self.inner.bus.publish_with_priority(
            Event::scan_request(COMPONENT, kind, None),
            EventPriority::High,
        );
        if accepted {
            self.inner.bus.publish(Event::system_status(
                COMPONENT,
                "manual_trigger",
                format!("manual {kind} scan requested"),
            ));
        }
        accepted
    }

    /// Fire `kind` daily at `local_time`, replacing any trigger for that kind.
    pub fn schedule_at(&self, local_time: NaiveTime, kind: ScanKind) {
        let now = self.inner.clock.now();
        {
            let mut tasks = self.inner.lock_tasks();
            let last_run = tasks.get(&kind).and_then(|t| t.last_run);
            let mut task = ScheduledTask::new(kind, local_time, true);
            task.last_run = last_run;
            task.reschedule(now, self.inner.tz);
            tracing::info!(kind = %kind, time = %local_time, "trigger scheduled");
            tasks.insert(kind, task);
        }
        self.save();
    }

    /// Enable or disable the trigger for `kind`. Returns whether it exists.
    pub fn set_enabled(&self, kind: ScanKind, enabled: bool) -> bool {
        let now = self.inner.clock.now();
        let mut tasks = self.inner.lock_tasks();
        let Some(task) = tasks.get_mut(&kind) else {
            return false;
        };
        task.enabled = enabled;
        task.reschedule(now, self.inner.tz);
        true
    }

    /// Current triggers and connection state.
    pub async fn status(&self) -> SchedulerStatus {
        let running = self.inner.workers.lock().await.is_some();
        SchedulerStatus {
            running,
            timezone: self.inner.tz.name().to_string(),
            connection: self
                .inner
                .chain
                .as_ref()
                .map(|c| *c.connection_state().borrow()),
            tasks: self.inner.lock_tasks().values().cloned().collect(),
        }
    }

    fn restore(&self, saved: &HashMap<String, SavedTask>) {
        let mut tasks = self.inner.lock_tasks();
        for (label, s) in saved {
            let Ok(kind) = label.parse::<ScanKind>() else {
                tracing::debug!(label = %label, "skipping unknown trigger in saved state");
                continue;
            };
            if let Some(task) = tasks.get_mut(&kind) {
                task.last_run = s.last_run;
            }
        }
        tracing::debug!(restored = saved.len(), "scheduler state restored");
    }

    fn save(&self) {
        save(&self.inner);
    }
}

fn tick(inner: &Inner, now: DateTime<Utc>) -> Vec<ScanKind> {
    let mut fired = Vec::new();
    {
        let mut tasks = inner.lock_tasks();
        for task in tasks.values_mut().filter(|t| t.is_due(now)) {
            tracing::info!(kind = %task.kind, time = %task.time, "scheduled scan firing");
            inner.bus.publish(Event::scan_request(COMPONENT, task.kind, None));
            let mut metrics = BTreeMap::new();
            metrics.insert("scan_kind".to_string(), task.kind.as_str().into());
            metrics.insert("scheduled_time".to_string(), task.time.format("%H:%M").to_string().into());
            metrics.insert("execution_time".to_string(), now.to_rfc3339().into());
            inner.bus.publish(Event::system_status_with_metrics(
                COMPONENT,
                "scan_triggered",
                format!("triggered {} scan", task.kind),
                metrics,
            ));
            task.last_run = Some(now);
            task.reschedule(now, inner.tz);
            fired.push(task.kind);
        }
    }
    if !fired.is_empty() {
        save(inner);
    }
    fired
}

async fn tick_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tick(&inner, inner.clock.now());
            }
        }
    }
    tracing::debug!("scheduler tick loop exited");
}

async fn watch_connection(
    chain: Arc<ProviderFallbackChain>,
    bus: EventBus,
    cancel: CancellationToken,
) {
    let mut rx = chain.connection_state();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *rx.borrow_and_update();
                bus.publish(Event::system_status(
                    "stream",
                    state.as_str(),
                    format!("stream connection {}", state.as_str()),
                ));
            }
        }
    }
}

fn load_state(path: &Path) -> Result<HashMap<String, SavedTask>, GapwatchError> {
    match std::fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| GapwatchError::persistence(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(GapwatchError::persistence(path, e)),
    }
}

fn save(inner: &Inner) {
    let Some(path) = inner.state_file.as_deref() else {
        return;
    };
    let saved: HashMap<String, SavedTask> = inner
        .lock_tasks()
        .values()
        .map(|t| (t.kind.as_str().to_string(), SavedTask { last_run: t.last_run }))
        .collect();
    let res = serde_json::to_vec_pretty(&saved)
        .map_err(|e| GapwatchError::persistence(path, e))
        .and_then(|body| {
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, body).map_err(|e| GapwatchError::persistence(&tmp, e))?;
            std::fs::rename(&tmp, path).map_err(|e| GapwatchError::persistence(path, e))
        });
    if let Err(e) = res {
        tracing::error!(error = %e, "failed to save scheduler state");
    }
}
