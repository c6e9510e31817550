//! Drives the scan pipeline with at most one run in flight.
//!
//! A new run, whether requested through a `ScanRequest` event or a direct
//! [`Coordinator::run_scan`] call, cancels the active one and waits for it to
//! finalize before starting. Bus requests are ticketed in dispatch order, so a
//! request that was overtaken by a newer one before it got to start is
//! dropped instead of cancelling its successor. Every run is bounded by the
//! configured deadline.

mod run;
pub mod state;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use gapwatch_core::{
    CoordinatorConfig, Event, EventKind, EventPayload, GapwatchError, ScanKind, Stages, Symbol,
};
use tokio::sync::MutexGuard;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::bus::{EventBus, SubscriptionId, handler_fn};
use crate::chain::ProviderFallbackChain;
use run::{Recorder, RunContext};
pub use state::{PipelineStep, RunState, WorkflowRun};

const COMPONENT: &str = "coordinator";

struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
    /// Cancelled by the run itself once it has finalized.
    done: CancellationToken,
}

struct Inner {
    ctx: RunContext,
    active: tokio::sync::Mutex<Option<ActiveRun>>,
    state: Mutex<RunState>,
    history: Mutex<VecDeque<WorkflowRun>>,
    next_id: AtomicU64,
    /// Ticket of the newest `ScanRequest` taken off the bus.
    latest_request: AtomicU64,
    subscription: Mutex<Option<SubscriptionId>>,
}

/// Cloneable handle to the workflow coordinator.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Build a coordinator publishing on `bus` and fetching through `chain`.
    #[must_use]
    pub fn new(
        bus: EventBus,
        chain: Arc<ProviderFallbackChain>,
        stages: Stages,
        cfg: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: RunContext {
                    bus,
                    chain,
                    stages,
                    cfg,
                },
                active: tokio::sync::Mutex::new(None),
                state: Mutex::new(RunState::Idle),
                history: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
                latest_request: AtomicU64::new(0),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Handle `ScanRequest` events from the bus. Each request runs on its own
    /// task so the dispatch loop is never blocked by a scan.
    pub fn start(&self) {
        let mut sub = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sub.is_some() {
            return;
        }
        let me = self.clone();
        let handler = handler_fn(move |ev: Arc<Event>| {
            let me = me.clone();
            async move {
                if let EventPayload::ScanRequest {
                    scan_kind,
                    universe,
                } = &ev.payload
                {
                    let (kind, universe) = (*scan_kind, universe.clone());
                    let ticket = me.inner.latest_request.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::spawn(async move {
                        me.run_requested(ticket, kind, universe).await;
                    });
                }
                Ok(())
            }
        });
        *sub = Some(
            self.inner
                .ctx
                .bus
                .subscribe(EventKind::ScanRequest, COMPONENT, handler),
        );
        tracing::info!("coordinator listening for scan requests");
    }

    /// Stop listening for requests and cancel the active run, waiting for it.
    /// Requests received but not yet started never run.
    pub async fn stop(&self) {
        let sub = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = sub {
            self.inner.ctx.bus.unsubscribe(Some(EventKind::ScanRequest), id);
        }
        // Requests already taken off the bus but not yet started are dropped.
        self.inner.latest_request.fetch_add(1, Ordering::SeqCst);
        let mut active = self.inner.active.lock().await;
        if let Some(prev) = active.take() {
            Self::cancel_and_wait(prev).await;
        }
        tracing::info!("coordinator stopped");
    }

    /// `Running` while a run is in flight, otherwise `Idle`.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recently finalized run.
    #[must_use]
    pub fn last_run(&self) -> Option<WorkflowRun> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    /// Finalized runs, oldest first, bounded by `history_capacity`.
    #[must_use]
    pub fn history(&self) -> Vec<WorkflowRun> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    async fn cancel_and_wait(prev: ActiveRun) {
        tracing::info!(run_id = prev.id, "cancelling in-flight run");
        prev.cancel.cancel();
        prev.done.cancelled().await;
    }

    /// Run one scan to completion and return its record.
    ///
    /// `universe` overrides universe resolution. Any run already in flight
    /// is cancelled and fully torn down first.
    pub async fn run_scan(&self, kind: ScanKind, universe: Option<Vec<Symbol>>) -> WorkflowRun {
        let active = self.inner.active.lock().await;
        self.launch(active, kind, universe).await
    }

    /// Run a bus request unless a newer one was taken off the bus meanwhile.
    async fn run_requested(&self, ticket: u64, kind: ScanKind, universe: Option<Vec<Symbol>>) {
        let active = self.inner.active.lock().await;
        if self.inner.latest_request.load(Ordering::SeqCst) != ticket {
            tracing::debug!(ticket, kind = %kind, "scan request superseded before it started");
            return;
        }
        self.launch(active, kind, universe).await;
    }

    /// Replace the active run, holding the slot until the new run is registered.
    async fn launch(
        &self,
        mut active: MutexGuard<'_, Option<ActiveRun>>,
        kind: ScanKind,
        universe: Option<Vec<Symbol>>,
    ) -> WorkflowRun {
        if let Some(prev) = active.take() {
            Self::cancel_and_wait(prev).await;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let guard = done.clone().drop_guard();
        self.set_state(RunState::Running);
        *active = Some(ActiveRun {
            id,
            cancel: cancel.clone(),
            done,
        });
        drop(active);

        let run = self.drive(id, kind, universe, &cancel).await;
        self.finish(id, guard).await;
        run
    }

    fn set_state(&self, next: RunState) {
        let mut cur = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        match cur.transition(next) {
            Ok(s) => *cur = s,
            Err(e) => tracing::error!(error = %e, "run state out of sync"),
        }
    }

    async fn drive(
        &self,
        id: u64,
        kind: ScanKind,
        universe: Option<Vec<Symbol>>,
        cancel: &CancellationToken,
    ) -> WorkflowRun {
        let ctx = &self.inner.ctx;
        let clock = Arc::clone(ctx.chain.clock());
        let rec: Recorder = Arc::new(Mutex::new(WorkflowRun::new(id, kind, clock.now())));
        tracing::info!(run_id = id, kind = %kind, "scan started");
        ctx.bus.publish(Event::system_status(
            COMPONENT,
            "scan_started",
            format!("{kind} scan #{id} started"),
        ));

        let deadline = ctx.cfg.run_deadline();
        let began = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(deadline, run::execute(ctx, &rec, universe, cancel)).await;
        let (terminal, failure) = match outcome {
            Ok(Ok(())) => (RunState::Completed, None),
            Ok(Err(GapwatchError::Cancelled)) => (RunState::Cancelled, None),
            Ok(Err(e)) => (RunState::Failed, Some(e)),
            Err(_) => (
                RunState::Failed,
                Some(GapwatchError::RunTimeout {
                    elapsed_ms: u64::try_from(began.elapsed().as_millis()).unwrap_or(u64::MAX),
                }),
            ),
        };

        let run = {
            let mut r = rec.lock().unwrap_or_else(PoisonError::into_inner);
            r.state = terminal;
            r.finished_at = Some(clock.now());
            if let Some(e) = failure.as_ref() {
                r.errors.push(e.clone());
            }
            r.clone()
        };
        self.set_state(terminal);

        let metrics = run.metrics();
        match (terminal, failure) {
            (RunState::Failed, Some(e)) => {
                tracing::warn!(run_id = id, error = %e, "scan failed");
                ctx.bus.publish(Event::system_status_with_metrics(
                    COMPONENT,
                    "scan_failed",
                    e.to_string(),
                    metrics,
                ));
                ctx.bus.publish(Event::from_error(COMPONENT, &e));
            }
            (RunState::Cancelled, _) => {
                tracing::info!(run_id = id, "scan cancelled");
                ctx.bus.publish(Event::system_status_with_metrics(
                    COMPONENT,
                    "scan_cancelled",
                    format!("{kind} scan #{id} cancelled"),
                    metrics,
                ));
            }
            _ => {
                tracing::info!(
                    run_id = id,
                    accepted = run.accepted_plans.len(),
                    errors = run.errors.len(),
                    "scan completed"
                );
                ctx.bus.publish(Event::system_status_with_metrics(
                    COMPONENT,
                    "scan_completed",
                    format!("{kind} scan #{id} completed"),
                    metrics,
                ));
            }
        }

        {
            let mut h = self.inner.history.lock().unwrap_or_else(PoisonError::into_inner);
            h.push_back(run.clone());
            while h.len() > ctx.cfg.history_capacity.max(1) {
                h.pop_front();
            }
        }
        self.set_state(RunState::Idle);
        run
    }

    async fn finish(&self, id: u64, guard: DropGuard) {
        // A replacement run may be holding the slot while it waits on `done`.
        drop(guard);
        let mut active = self.inner.active.lock().await;
        if active.as_ref().is_some_and(|a| a.id == id) {
            *active = None;
        }
    }
}
