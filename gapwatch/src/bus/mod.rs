//! Prioritized publish/subscribe dispatcher.
//!
//! Events wait in a bounded max-heap ordered by priority, then publish order.
//! A single dispatch task pops one event at a time and runs every matching
//! handler concurrently on its own task, so a failing or panicking handler
//! cannot disturb its siblings or the loop itself. Handler failures become
//! `Error` events, except while handling an `Error` event.

mod handler;
mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use gapwatch_core::{BusConfig, Clock, Event, EventKind, EventPriority, GapwatchError, SystemClock};
use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

pub use handler::{EventFilter, EventHandler, filter_fn, handler_fn};
use queue::{PriorityQueue, Queued};

/// Identifies one subscription.
pub type SubscriptionId = u64;

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Counters exposed by the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusMetrics {
    /// Events accepted into the queue.
    pub events_published: u64,
    /// Events fully dispatched.
    pub events_processed: u64,
    /// Handler invocations that failed or panicked.
    pub events_failed: u64,
    /// Events rejected because the queue was full or the bus was stopped.
    pub events_dropped: u64,
    /// Events waiting in the queue.
    pub queue_size: usize,
    /// Active subscriptions, wildcard included.
    pub subscriber_count: usize,
}

struct Subscription {
    id: SubscriptionId,
    name: String,
    handler: Arc<dyn EventHandler>,
    filter: Option<EventFilter>,
}

struct Worker {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct Inner {
    queue: Mutex<PriorityQueue>,
    // `None` holds wildcard subscriptions.
    subscribers: RwLock<HashMap<Option<EventKind>, Vec<Subscription>>>,
    notify: Notify,
    accepting: AtomicBool,
    dispatching: AtomicBool,
    next_id: AtomicU64,
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    drain_timeout: Duration,
    clock: Arc<dyn Clock>,
    worker: Mutex<Option<Worker>>,
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, PriorityQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp the publish time and queue.
    fn enqueue(&self, mut event: Event, priority: EventPriority) -> bool {
        event.timestamp = self.clock.now();
        let kind = event.kind();
        let pushed = self.lock_queue().push(Arc::new(event), priority);
        if pushed.is_ok() {
            self.published.fetch_add(1, Ordering::Relaxed);
            self.notify.notify_one();
            true
        } else {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(kind = %kind, dropped, "event queue full; dropping event");
            false
        }
    }

    fn pop(&self) -> Option<Queued> {
        let mut q = self.lock_queue();
        let next = q.pop();
        // Set under the queue lock so `is_idle` never sees a gap.
        self.dispatching.store(next.is_some(), Ordering::SeqCst);
        next
    }

    fn is_idle(&self) -> bool {
        let q = self.lock_queue();
        q.is_empty() && !self.dispatching.load(Ordering::SeqCst)
    }

    fn targets(&self, event: &Event) -> Vec<(String, Arc<dyn EventHandler>)> {
        let subs = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let exact = subs.get(&Some(event.kind())).into_iter().flatten();
        let wildcard = subs.get(&None).into_iter().flatten();
        exact
            .chain(wildcard)
            .filter(|s| s.filter.as_ref().is_none_or(|f| f(event)))
            .map(|s| (s.name.clone(), Arc::clone(&s.handler)))
            .collect()
    }

    async fn dispatch(&self, queued: Queued) {
        let event = queued.event;
        let kind = event.kind();
        let targets = self.targets(&event);
        tracing::trace!(kind = %kind, priority = ?queued.priority, handlers = targets.len(), "dispatching event");

        let (names, joins): (Vec<String>, Vec<JoinHandle<Result<(), GapwatchError>>>) = targets
            .into_iter()
            .map(|(name, handler)| {
                let ev = Arc::clone(&event);
                (name, tokio::spawn(async move { handler.handle(ev).await }))
            })
            .unzip();

        let results = futures::future::join_all(joins).await;
        for (name, res) in names.into_iter().zip(results) {
            let failure = match res {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(join_err) => panic_message(join_err),
            };
            self.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(handler = %name, kind = %kind, error = %failure, "event handler failed");
            if kind != EventKind::Error {
                let err = GapwatchError::handler(name, failure);
                let ev = Event::from_error("event_bus", &err);
                let priority = ev.priority;
                self.enqueue(ev, priority);
            }
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "handler task cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string()),
        Err(_) => "handler task failed".to_string(),
    }
}

async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        match inner.pop() {
            Some(queued) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = inner.dispatch(queued) => {}
                }
                inner.dispatching.store(false, Ordering::SeqCst);
            }
            None => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = inner.notify.notified() => {}
                }
            }
        }
    }
    tracing::debug!("event dispatch loop exited");
}

/// Cloneable handle to one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

impl EventBus {
    /// A stopped bus sized from configuration.
    #[must_use]
    pub fn new(cfg: &BusConfig) -> Self {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    /// A stopped bus that stamps publish times from `clock`.
    #[must_use]
    pub fn with_clock(cfg: &BusConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(cfg.capacity, cfg.drain_timeout(), clock)
    }

    /// A stopped bus with an explicit capacity and drain timeout.
    #[must_use]
    pub fn with_limits(capacity: usize, drain_timeout: Duration) -> Self {
        Self::build(capacity, drain_timeout, Arc::new(SystemClock))
    }

    fn build(capacity: usize, drain_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(PriorityQueue::new(capacity)),
                subscribers: RwLock::new(HashMap::new()),
                notify: Notify::new(),
                accepting: AtomicBool::new(false),
                dispatching: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                drain_timeout,
                clock,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Spawn the dispatch loop. Calling it on a running bus is a no-op.
    pub async fn start(&self) {
        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run(Arc::clone(&self.inner), cancel.clone()));
        *worker = Some(Worker { cancel, join });
        self.inner.accepting.store(true, Ordering::SeqCst);
        tracing::info!("event bus started");
    }

    /// Stop accepting events, drain the queue within the drain timeout, then
    /// cancel the dispatch loop. Events still queued after the timeout are
    /// discarded and counted as dropped.
    pub async fn stop(&self) {
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        self.inner.accepting.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let drained = tokio::time::timeout(self.inner.drain_timeout, async move {
            while !inner.is_idle() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await
        .is_ok();

        worker.cancel.cancel();
        let _ = worker.join.await;

        if !drained {
            let mut q = self.inner.lock_queue();
            let mut discarded = 0u64;
            while q.pop().is_some() {
                discarded += 1;
            }
            self.inner.dropped.fetch_add(discarded, Ordering::Relaxed);
            tracing::warn!(discarded, "event bus drain timed out");
        }
        self.inner.dispatching.store(false, Ordering::SeqCst);
        tracing::info!(metrics = ?self.metrics(), "event bus stopped");
    }

    /// Whether publishes are currently accepted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Queue `event` at its own priority. Never blocks.
    ///
    /// Returns `false` when the event was dropped: the queue is full or the
    /// bus is not running.
    pub fn publish(&self, event: Event) -> bool {
        let priority = event.priority;
        self.publish_with_priority(event, priority)
    }

    /// Queue `event` at `priority` instead of its own.
    pub fn publish_with_priority(&self, mut event: Event, priority: EventPriority) -> bool {
        if !self.is_running() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(kind = %event.kind(), "bus not running; dropping event");
            return false;
        }
        event.priority = priority;
        self.inner.enqueue(event, priority)
    }

    fn insert(
        &self,
        kind: Option<EventKind>,
        name: String,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
    ) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Subscription {
                id,
                name,
                handler,
                filter,
            });
        id
    }

    /// Subscribe `handler` to every event of `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.insert(Some(kind), name.into(), handler, None)
    }

    /// Subscribe `handler` to events of `kind` accepted by `filter`.
    pub fn subscribe_filtered(
        &self,
        kind: EventKind,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        filter: EventFilter,
    ) -> SubscriptionId {
        self.insert(Some(kind), name.into(), handler, Some(filter))
    }

    /// Subscribe `handler` to every event.
    pub fn subscribe_all(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.insert(None, name.into(), handler, None)
    }

    /// Remove a subscription; `kind` is `None` for wildcard subscriptions.
    /// Returns whether it existed.
    pub fn unsubscribe(&self, kind: Option<EventKind>, id: SubscriptionId) -> bool {
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subs.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(&kind);
        }
        removed
    }

    /// Wait for the next event of `kind` accepted by `filter`.
    ///
    /// Returns `None` if nothing matched within `timeout`.
    pub async fn wait_for(
        &self,
        kind: EventKind,
        timeout: Duration,
        filter: Option<EventFilter>,
    ) -> Option<Arc<Event>> {
        let (tx, rx) = oneshot::channel::<Arc<Event>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let handler = handler_fn(move |ev: Arc<Event>| {
            let slot = Arc::clone(&slot);
            async move {
                let tx = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(tx) = tx {
                    let _ = tx.send(ev);
                }
                Ok(())
            }
        });
        let id = self.insert(Some(kind), format!("wait_for:{kind}"), handler, filter);
        let got = tokio::time::timeout(timeout, rx).await;
        self.unsubscribe(Some(kind), id);
        got.ok().and_then(Result::ok)
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> BusMetrics {
        let subscriber_count = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum();
        BusMetrics {
            events_published: self.inner.published.load(Ordering::Relaxed),
            events_processed: self.inner.processed.load(Ordering::Relaxed),
            events_failed: self.inner.failed.load(Ordering::Relaxed),
            events_dropped: self.inner.dropped.load(Ordering::Relaxed),
            queue_size: self.inner.lock_queue().len(),
            subscriber_count,
        }
    }
}
