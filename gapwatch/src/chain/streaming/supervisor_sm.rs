//! Pure reconnect state machine for the streaming leg.
//!
//! The controller feeds it events and performs the returned actions; the
//! machine itself never touches tasks, timers or channels.

use std::sync::Arc;

use gapwatch_core::{BackoffConfig, ConnectionState, GapwatchError, Symbol};

use super::backoff::ReconnectBackoff;

/// Where the supervisor is in the connect cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Nothing to stream.
    Idle,
    /// Waiting on a connect attempt.
    Connecting,
    /// `received` turns true with the first message of the session.
    Connected {
        /// Whether a message arrived in this session.
        received: bool,
    },
    /// Waiting out a reconnect delay.
    Backoff,
    /// Terminal.
    Stopped,
}

/// Inputs to the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The desired symbol set changed (or was set initially).
    SymbolsChanged(Arc<[Symbol]>),
    /// The pending connect opened a session.
    ConnectSucceeded,
    /// The pending connect failed or timed out.
    ConnectFailed(GapwatchError),
    /// A quote arrived on the open session.
    MessageReceived,
    /// The open session closed.
    SessionEnded,
    /// The reconnect timer fired.
    BackoffElapsed,
    /// Stop for good.
    Shutdown,
}

/// Effects the controller performs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Open a session for the full desired set.
    Connect {
        /// Symbols to subscribe.
        symbols: Arc<[Symbol]>,
    },
    /// Close the current session and abandon any pending connect.
    StopSession,
    /// Arm the reconnect timer.
    ScheduleReconnect {
        /// Delay before jitter.
        delay_ms: u64,
    },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Report a new connection state.
    Publish(ConnectionState),
}

/// Reconnect supervisor state.
#[derive(Clone, Debug)]
pub struct Supervisor {
    /// Current phase.
    pub phase: Phase,
    /// Desired symbol set.
    pub symbols: Arc<[Symbol]>,
    /// Delay schedule.
    pub backoff: ReconnectBackoff,
    /// Failures since the last session that delivered a message.
    pub consecutive_failures: u32,
}

impl Supervisor {
    /// Idle supervisor with no symbols.
    #[must_use]
    pub fn new(cfg: &BackoffConfig) -> Self {
        Self {
            phase: Phase::Idle,
            symbols: Arc::from(Vec::new()),
            backoff: ReconnectBackoff::new(cfg),
            consecutive_failures: 0,
        }
    }

    /// Connection state reported for the current phase.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        match self.phase {
            Phase::Idle => ConnectionState::Idle,
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Connected { .. } => ConnectionState::Connected,
            Phase::Backoff => ConnectionState::Backoff,
            Phase::Stopped => ConnectionState::Stopped,
        }
    }

    /// Apply one event, returning the next state and the actions to perform.
    #[must_use]
    pub fn handle(mut self, event: Event) -> (Self, Vec<Action>) {
        match (self.phase, event) {
            (Phase::Stopped, _) => (self, Vec::new()),
            (_, Event::Shutdown) => {
                self.phase = Phase::Stopped;
                (
                    self,
                    vec![
                        Action::StopSession,
                        Action::CancelReconnect,
                        Action::Publish(ConnectionState::Stopped),
                    ],
                )
            }
            (phase, Event::SymbolsChanged(symbols)) => {
                let empty = symbols.is_empty();
                self.symbols = symbols;
                if empty {
                    self.phase = Phase::Idle;
                    return (
                        self,
                        vec![
                            Action::StopSession,
                            Action::CancelReconnect,
                            Action::Publish(ConnectionState::Idle),
                        ],
                    );
                }
                match phase {
                    Phase::Idle => self.connect(Vec::new()),
                    // Restart with the new set; not a failure.
                    Phase::Connecting | Phase::Connected { .. } => {
                        self.connect(vec![Action::StopSession])
                    }
                    // The next attempt picks up the new set.
                    Phase::Backoff | Phase::Stopped => (self, Vec::new()),
                }
            }
            (Phase::Connecting, Event::ConnectSucceeded) => {
                self.phase = Phase::Connected { received: false };
                (self, vec![Action::Publish(ConnectionState::Connected)])
            }
            (Phase::Connecting, Event::ConnectFailed(_))
            | (Phase::Connected { .. }, Event::SessionEnded) => self.fail(),
            (Phase::Connected { received: false }, Event::MessageReceived) => {
                self.backoff.reset();
                self.consecutive_failures = 0;
                self.phase = Phase::Connected { received: true };
                (self, Vec::new())
            }
            (Phase::Backoff, Event::BackoffElapsed) => {
                if self.symbols.is_empty() {
                    self.phase = Phase::Idle;
                    (self, vec![Action::Publish(ConnectionState::Idle)])
                } else {
                    self.connect(Vec::new())
                }
            }
            // Stale or redundant signals.
            (_, _) => (self, Vec::new()),
        }
    }

    fn connect(mut self, mut actions: Vec<Action>) -> (Self, Vec<Action>) {
        self.phase = Phase::Connecting;
        actions.push(Action::Connect {
            symbols: Arc::clone(&self.symbols),
        });
        actions.push(Action::Publish(ConnectionState::Connecting));
        (self, actions)
    }

    fn fail(mut self) -> (Self, Vec<Action>) {
        let delay_ms = self.backoff.next_delay();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.phase = Phase::Backoff;
        (
            self,
            vec![
                Action::StopSession,
                Action::ScheduleReconnect { delay_ms },
                Action::Publish(ConnectionState::Backoff),
            ],
        )
    }
}
