//! Streaming leg of the chain: one supervised session on the best streaming
//! provider, feeding the latest-quote map and push callbacks.

/// Reconnect delay schedule.
pub mod backoff;
pub(crate) mod controller;
pub mod supervisor_sm;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use gapwatch_core::{ConnectionState, Quote, Symbol};
use tokio::sync::watch;

/// Callback run for every streamed quote.
pub type QuoteCallback = Arc<dyn Fn(&Quote) + Send + Sync>;

/// Where streamed quotes land: the latest quote per symbol plus push callbacks.
pub(crate) struct QuoteSink {
    latest: RwLock<HashMap<Symbol, Quote>>,
    callbacks: RwLock<Vec<QuoteCallback>>,
    state: watch::Sender<ConnectionState>,
}

impl QuoteSink {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            latest: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            state,
        }
    }

    pub fn push(&self, quote: Quote) {
        let callbacks: Vec<QuoteCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for cb in &callbacks {
            cb(&quote);
        }
        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(quote.symbol.clone(), quote);
    }

    pub fn latest(&self, symbol: &Symbol) -> Option<Quote> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned()
    }

    pub fn latest_all(&self) -> HashMap<Symbol, Quote> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn register(&self, cb: QuoteCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cb);
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|cur| {
            if *cur == state {
                false
            } else {
                *cur = state;
                true
            }
        });
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}
