use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};

use gapwatch_core::connector::{DataProvider, HistoryProvider, QuoteProvider, StreamProvider};
use gapwatch_core::{Bar, DataPriority, GapwatchError, HistoryRequest, Quote, StreamHandle, Symbol};

/// Instruction for how a method should behave for a given input.
#[derive(Clone, Debug)]
pub enum MockBehavior<T> {
    /// Return the provided value immediately.
    Return(T),
    /// Fail immediately with the provided error.
    Fail(GapwatchError),
    /// Hang indefinitely (simulate a timeout).
    Hang,
}

/// Instruction for how the next stream session should behave.
#[derive(Clone, Debug)]
pub enum StreamBehavior {
    /// Open a session and send these quotes (filtered by requested symbols), then stay open.
    Success(Vec<Quote>),
    /// Fail the `stream_quotes` call immediately.
    Fail(GapwatchError),
    /// Hang the `stream_quotes` call (simulate a stall during connect).
    Hang,
    /// Open a session that forwards quotes pushed through the controller.
    Manual,
}

#[derive(Default)]
struct InternalState {
    quote_rules: HashMap<Symbol, MockBehavior<Quote>>,
    history_rules: HashMap<Symbol, MockBehavior<Vec<Bar>>>,
    stream_behavior: Option<StreamBehavior>,
    stream_requests: Vec<Vec<Symbol>>,
    kill_switch: Option<oneshot::Sender<()>>,
    manual_tx: Option<mpsc::Sender<Quote>>,
}

struct Shared {
    state: Mutex<InternalState>,
    healthy: AtomicBool,
    quote_calls: AtomicUsize,
    history_calls: AtomicUsize,
    health_checks: AtomicUsize,
}

/// Controller handle used by tests to drive a [`DynamicMockProvider`] from the outside.
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Shared>,
}

impl MockController {
    /// Set the behavior for `quote` calls for a specific symbol.
    pub async fn set_quote_behavior(&self, symbol: impl Into<Symbol>, behavior: MockBehavior<Quote>) {
        let mut guard = self.shared.state.lock().await;
        guard.quote_rules.insert(symbol.into(), behavior);
    }

    /// Set the behavior for `history` calls for a specific symbol.
    pub async fn set_history_behavior(
        &self,
        symbol: impl Into<Symbol>,
        behavior: MockBehavior<Vec<Bar>>,
    ) {
        let mut guard = self.shared.state.lock().await;
        guard.history_rules.insert(symbol.into(), behavior);
    }

    /// Set the behavior for subsequent stream sessions.
    pub async fn set_stream_behavior(&self, behavior: StreamBehavior) {
        let mut guard = self.shared.state.lock().await;
        guard.stream_behavior = Some(behavior);
    }

    /// Toggle the result of `health_check`.
    pub fn set_healthy(&self, healthy: bool) {
        self.shared.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Remotely end the active stream session.
    pub async fn fail_stream(&self) {
        let mut guard = self.shared.state.lock().await;
        if let Some(tx) = guard.kill_switch.take() {
            let _ = tx.send(());
        }
    }

    /// Push a quote into an active Manual session.
    ///
    /// Returns `true` if the quote was queued, `false` if no Manual session is active
    /// or the channel is closed.
    pub async fn push_quote(&self, quote: Quote) -> bool {
        let tx = {
            let guard = self.shared.state.lock().await;
            guard.manual_tx.clone()
        };
        match tx {
            Some(tx) => tx.send(quote).await.is_ok(),
            None => false,
        }
    }

    /// Symbol sets requested by every `stream_quotes` call so far.
    pub async fn stream_requests(&self) -> Vec<Vec<Symbol>> {
        self.shared.state.lock().await.stream_requests.clone()
    }

    /// Number of `quote`/`quotes` calls served (batched calls count once).
    #[must_use]
    pub fn quote_calls(&self) -> usize {
        self.shared.quote_calls.load(Ordering::SeqCst)
    }

    /// Number of `history` calls served.
    #[must_use]
    pub fn history_calls(&self) -> usize {
        self.shared.history_calls.load(Ordering::SeqCst)
    }

    /// Number of health checks performed.
    #[must_use]
    pub fn health_checks(&self) -> usize {
        self.shared.health_checks.load(Ordering::SeqCst)
    }

    /// Clear all configured behaviors and request logs.
    pub async fn clear_all_behaviors(&self) {
        let mut guard = self.shared.state.lock().await;
        guard.quote_rules.clear();
        guard.history_rules.clear();
        guard.stream_behavior = None;
        guard.stream_requests.clear();
    }
}

/// A provider that defers all behavior to an external controller.
///
/// Symbols without a configured quote rule resolve to `Ok(None)`; history
/// without a rule resolves to an empty vector.
pub struct DynamicMockProvider {
    name: &'static str,
    rank: DataPriority,
    streams: bool,
    shared: Arc<Shared>,
}

impl DynamicMockProvider {
    fn build(name: &'static str, rank: DataPriority, streams: bool) -> (Arc<dyn DataProvider>, MockController) {
        let shared = Arc::new(Shared {
            state: Mutex::new(InternalState::default()),
            healthy: AtomicBool::new(true),
            quote_calls: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
        });
        let controller = MockController {
            shared: Arc::clone(&shared),
        };
        let me = Arc::new(Self {
            name,
            rank,
            streams,
            shared,
        });
        (me as Arc<dyn DataProvider>, controller)
    }

    /// A polled provider (quotes and history) and its controller.
    #[must_use]
    pub fn new_with_controller(
        name: &'static str,
        rank: DataPriority,
    ) -> (Arc<dyn DataProvider>, MockController) {
        Self::build(name, rank, false)
    }

    /// A provider that also streams, and its controller.
    #[must_use]
    pub fn streaming_with_controller(
        name: &'static str,
        rank: DataPriority,
    ) -> (Arc<dyn DataProvider>, MockController) {
        Self::build(name, rank, true)
    }
}

#[async_trait]
impl DataProvider for DynamicMockProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn rank(&self) -> DataPriority {
        self.rank
    }

    async fn health_check(&self) -> bool {
        self.shared.health_checks.fetch_add(1, Ordering::SeqCst);
        self.shared.healthy.load(Ordering::SeqCst)
    }

    fn as_quote_provider(&self) -> Option<&dyn QuoteProvider> {
        Some(self as &dyn QuoteProvider)
    }

    fn as_history_provider(&self) -> Option<&dyn HistoryProvider> {
        Some(self as &dyn HistoryProvider)
    }

    fn as_stream_provider(&self) -> Option<&dyn StreamProvider> {
        if self.streams {
            Some(self as &dyn StreamProvider)
        } else {
            None
        }
    }
}

impl DynamicMockProvider {
    async fn quote_rule(&self, symbol: &Symbol) -> Result<Option<Quote>, GapwatchError> {
        let behavior = {
            let guard = self.shared.state.lock().await;
            guard.quote_rules.get(symbol).cloned()
        };
        match behavior {
            Some(MockBehavior::Return(mut q)) => {
                q.provider = self.name.to_string();
                Ok(Some(q))
            }
            Some(MockBehavior::Fail(e)) => Err(e),
            Some(MockBehavior::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl QuoteProvider for DynamicMockProvider {
    async fn quote(&self, symbol: &Symbol) -> Result<Option<Quote>, GapwatchError> {
        self.shared.quote_calls.fetch_add(1, Ordering::SeqCst);
        self.quote_rule(symbol).await
    }

    async fn quotes(&self, symbols: &[Symbol]) -> Result<HashMap<Symbol, Quote>, GapwatchError> {
        self.shared.quote_calls.fetch_add(1, Ordering::SeqCst);
        let mut out = HashMap::new();
        for s in symbols {
            if let Some(q) = self.quote_rule(s).await? {
                out.insert(s.clone(), q);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl HistoryProvider for DynamicMockProvider {
    async fn history(&self, symbol: &Symbol, _req: HistoryRequest) -> Result<Vec<Bar>, GapwatchError> {
        self.shared.history_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = {
            let guard = self.shared.state.lock().await;
            guard.history_rules.get(symbol).cloned()
        };
        match behavior {
            Some(MockBehavior::Return(bars)) => Ok(bars),
            Some(MockBehavior::Fail(e)) => Err(e),
            Some(MockBehavior::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl StreamProvider for DynamicMockProvider {
    async fn stream_quotes(
        &self,
        symbols: &[Symbol],
    ) -> Result<(StreamHandle, mpsc::Receiver<Quote>), GapwatchError> {
        let behavior = {
            let mut guard = self.shared.state.lock().await;
            guard.stream_requests.push(symbols.to_vec());
            guard.stream_behavior.clone()
        };

        let allow: std::collections::HashSet<Symbol> = symbols.iter().cloned().collect();
        let name = self.name;
        match behavior {
            Some(StreamBehavior::Fail(e)) => Err(e),
            Some(StreamBehavior::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(StreamBehavior::Manual) => {
                let (tx, rx) = mpsc::channel::<Quote>(1024);
                let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
                let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
                let (in_tx, mut in_rx) = mpsc::channel::<Quote>(1024);
                {
                    let mut guard = self.shared.state.lock().await;
                    guard.kill_switch = Some(kill_tx);
                    guard.manual_tx = Some(in_tx);
                }

                let join = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = &mut stop_rx => break,
                            _ = &mut kill_rx => break,
                            maybe_q = in_rx.recv() => {
                                let Some(mut q) = maybe_q else { break };
                                if !allow.contains(&q.symbol) {
                                    continue;
                                }
                                q.provider = name.to_string();
                                if tx.send(q).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
                Ok((StreamHandle::new(join, stop_tx), rx))
            }
            Some(StreamBehavior::Success(quotes)) => {
                let (tx, rx) = mpsc::channel::<Quote>(1024);
                let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
                let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
                {
                    let mut guard = self.shared.state.lock().await;
                    guard.kill_switch = Some(kill_tx);
                    guard.manual_tx = None;
                }

                let join = tokio::spawn(async move {
                    for mut q in quotes {
                        if !allow.contains(&q.symbol) {
                            continue;
                        }
                        q.provider = name.to_string();
                        tokio::select! {
                            biased;
                            _ = &mut stop_rx => return,
                            _ = &mut kill_rx => return,
                            res = tx.send(q) => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    tokio::select! {
                        _ = &mut stop_rx => {}
                        _ = &mut kill_rx => {}
                    }
                });
                Ok((StreamHandle::new(join, stop_tx), rx))
            }
            None => Err(GapwatchError::stream_disconnect(name, "no stream behavior configured")),
        }
    }
}
