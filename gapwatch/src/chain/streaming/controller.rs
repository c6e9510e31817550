use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use gapwatch_core::{BackoffConfig, DataProvider, GapwatchError, Quote, StreamHandle, Symbol};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use super::QuoteSink;
use super::backoff::jitter_wait;
use super::supervisor_sm::{self as sm, Action, Phase, Supervisor};
use crate::chain::util::provider_call_with_timeout;

pub(crate) struct StreamParams {
    pub provider: Arc<dyn DataProvider>,
    pub symbols: watch::Receiver<Arc<[Symbol]>>,
    pub sink: Arc<QuoteSink>,
    pub backoff: BackoffConfig,
    pub connect_timeout: Duration,
}

struct Session {
    handle: StreamHandle,
    rx: mpsc::Receiver<Quote>,
}

enum Wake {
    Stop,
    Symbols(Option<Arc<[Symbol]>>),
    Connected(Result<Session, GapwatchError>),
    Quote(Option<Quote>),
    Timer,
}

async fn poll_slot<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot.as_mut() {
        Some(f) => f.await,
        None => std::future::pending().await,
    }
}

async fn recv_session(slot: &mut Option<Session>) -> Option<Quote> {
    match slot.as_mut() {
        Some(s) => s.rx.recv().await,
        None => std::future::pending().await,
    }
}

fn connect(
    provider: Arc<dyn DataProvider>,
    symbols: Arc<[Symbol]>,
    timeout: Duration,
) -> BoxFuture<'static, Result<Session, GapwatchError>> {
    async move {
        let name = provider.name();
        let Some(sp) = provider.as_stream_provider() else {
            return Err(GapwatchError::stream_disconnect(name, "provider cannot stream"));
        };
        let (handle, rx) =
            provider_call_with_timeout(name, "stream", timeout, sp.stream_quotes(&symbols)).await?;
        Ok(Session { handle, rx })
    }
    .boxed()
}

/// Run the reconnect loop for one streaming provider until `cancel` fires
/// or the desired-symbol channel closes.
pub(crate) fn spawn_stream_supervisor(
    params: StreamParams,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let StreamParams {
            provider,
            mut symbols,
            sink,
            backoff,
            connect_timeout,
        } = params;
        let name = provider.name();
        let delayed = provider.rank().is_delayed();
        let jitter = u32::from(backoff.jitter_percent);

        let mut supervisor = Supervisor::new(&backoff);
        let mut connecting: Option<BoxFuture<'static, Result<Session, GapwatchError>>> = None;
        let mut session: Option<Session> = None;
        let mut timer: Option<Pin<Box<Sleep>>> = None;

        let initial = symbols.borrow_and_update().clone();
        let mut pending = vec![sm::Event::SymbolsChanged(initial)];

        loop {
            for event in pending.drain(..) {
                let (next, actions) = supervisor.handle(event);
                supervisor = next;
                for action in actions {
                    match action {
                        Action::Connect { symbols } => {
                            tracing::info!(provider = name, symbols = symbols.len(), "opening stream session");
                            connecting = Some(connect(Arc::clone(&provider), symbols, connect_timeout));
                        }
                        Action::StopSession => {
                            connecting = None;
                            if let Some(s) = session.take() {
                                s.handle.stop().await;
                            }
                        }
                        Action::ScheduleReconnect { delay_ms } => {
                            let wait = jitter_wait(delay_ms, jitter, supervisor.backoff.cap());
                            tracing::warn!(
                                provider = name,
                                delay_ms = wait,
                                failures = supervisor.consecutive_failures,
                                "stream down; reconnecting after backoff"
                            );
                            timer = Some(Box::pin(tokio::time::sleep(Duration::from_millis(wait))));
                        }
                        Action::CancelReconnect => timer = None,
                        Action::Publish(state) => sink.set_state(state),
                    }
                }
            }
            if supervisor.phase == Phase::Stopped {
                break;
            }

            let wake = tokio::select! {
                biased;
                () = cancel.cancelled() => Wake::Stop,
                changed = symbols.changed() => Wake::Symbols(changed.ok().map(|()| Arc::clone(&*symbols.borrow_and_update()))),
                res = poll_slot(&mut connecting) => Wake::Connected(res),
                q = recv_session(&mut session) => Wake::Quote(q),
                () = poll_slot(&mut timer) => Wake::Timer,
            };

            let event = match wake {
                Wake::Stop | Wake::Symbols(None) => sm::Event::Shutdown,
                Wake::Symbols(Some(set)) => sm::Event::SymbolsChanged(set),
                Wake::Connected(res) => {
                    connecting = None;
                    match res {
                        Ok(s) => {
                            tracing::info!(provider = name, "stream connected");
                            session = Some(s);
                            sm::Event::ConnectSucceeded
                        }
                        Err(e) => {
                            tracing::warn!(provider = name, error = %e, "stream connect failed");
                            sm::Event::ConnectFailed(e)
                        }
                    }
                }
                Wake::Quote(Some(mut q)) => {
                    if q.provider.is_empty() {
                        q.provider = name.to_string();
                    }
                    q.delayed = delayed;
                    sink.push(q);
                    sm::Event::MessageReceived
                }
                Wake::Quote(None) => {
                    session = None;
                    tracing::warn!(provider = name, "stream session ended");
                    sm::Event::SessionEnded
                }
                Wake::Timer => {
                    timer = None;
                    sm::Event::BackoffElapsed
                }
            };
            pending.push(event);
        }
        tracing::info!(provider = name, "stream supervisor stopped");
    })
}
